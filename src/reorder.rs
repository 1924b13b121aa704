//! Metric reordering across adjacent packets.
//!
//! Metric offsets may be negative, so a later packet can carry metrics that
//! are earlier in absolute device time than metrics from the packet before
//! it. The reorder window buffers the last `W` packets and emits each
//! packet's metrics, merged into device-time order, only when the packet is
//! evicted from the window. Emitted metrics carry a [`PacketId`] so they can
//! be interpreted away from their packet; consumers that need full packet
//! metadata keep a [`PacketRegistry`].

use crate::frame::{Metric, Packet, PacketId};
use crate::hub::Hub;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Default window size: tolerates out-of-order metrics spanning two
/// adjacent packets at the cost of one packet of latency.
pub const DEFAULT_WINDOW: usize = 2;

/// One metric annotated with the packet it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedMetric {
    pub packet_id: PacketId,
    pub metric: Metric,
}

// ---------------------------------------------------------------------------
// ReorderWindow
// ---------------------------------------------------------------------------

struct TimedEntry {
    device_time_us: i64,
    /// Arrival tiebreaker: earlier-arrived metrics win equal device times.
    seq: u64,
    packet_id: PacketId,
    metric: Metric,
}

struct PendingPacket {
    id: PacketId,
    /// Metrics without a device time, in arrival order; emitted when the
    /// packet is evicted, after its timed metrics.
    untimed: Vec<Metric>,
}

/// Buffer-of-last-`W`-packets serializer.
///
/// Once a metric has been emitted, no later-emitted metric from a packet
/// inside the window at that moment can precede it in device time.
pub struct ReorderWindow {
    window: usize,
    fifo: VecDeque<PendingPacket>,
    /// Merged metrics of all buffered packets, sorted by
    /// (device_time_us, arrival seq).
    timed: Vec<TimedEntry>,
    next_seq: u64,
}

impl ReorderWindow {
    /// `window` is clamped to at least 1.
    pub fn new(window: usize) -> ReorderWindow {
        ReorderWindow {
            window: window.max(1),
            fifo: VecDeque::new(),
            timed: Vec::new(),
            next_seq: 0,
        }
    }

    /// Feed one packet; returns the metrics released by this arrival.
    ///
    /// Errored packets are ignored. Packets with no metrics still occupy a
    /// window slot and emit nothing when evicted.
    pub fn push(&mut self, packet: &Packet) -> Vec<SequencedMetric> {
        if packet.error.is_some() {
            return Vec::new();
        }
        let id = packet.id();
        let mut untimed = Vec::new();
        for metric in &packet.metrics {
            match metric.device_time_us {
                Some(us) => {
                    let entry = TimedEntry {
                        device_time_us: us,
                        seq: self.next_seq,
                        packet_id: id.clone(),
                        metric: metric.clone(),
                    };
                    self.next_seq += 1;
                    let at = self
                        .timed
                        .partition_point(|e| (e.device_time_us, e.seq) <= (us, entry.seq));
                    self.timed.insert(at, entry);
                }
                None => untimed.push(metric.clone()),
            }
        }
        self.fifo.push_back(PendingPacket { id, untimed });

        if self.fifo.len() > self.window {
            self.evict_oldest()
        } else {
            Vec::new()
        }
    }

    /// Evict everything still buffered, oldest packet first. Used at
    /// shutdown so no tail metrics are lost.
    pub fn flush(&mut self) -> Vec<SequencedMetric> {
        let mut out = Vec::new();
        while !self.fifo.is_empty() {
            out.extend(self.evict_oldest());
        }
        out
    }

    pub fn buffered_packets(&self) -> usize {
        self.fifo.len()
    }

    fn evict_oldest(&mut self) -> Vec<SequencedMetric> {
        let Some(oldest) = self.fifo.pop_front() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        // Extract the evicted packet's metrics from the sorted buffer,
        // preserving the buffer's order.
        let mut kept = Vec::with_capacity(self.timed.len());
        for entry in self.timed.drain(..) {
            if entry.packet_id == oldest.id {
                out.push(SequencedMetric {
                    packet_id: entry.packet_id,
                    metric: entry.metric,
                });
            } else {
                kept.push(entry);
            }
        }
        self.timed = kept;
        out.extend(oldest.untimed.into_iter().map(|metric| SequencedMetric {
            packet_id: oldest.id.clone(),
            metric,
        }));
        out
    }
}

// ---------------------------------------------------------------------------
// PacketRegistry
// ---------------------------------------------------------------------------

/// Bounded id -> packet map for consumers of sequenced metrics that want
/// full packet metadata. Oldest entries are evicted first.
pub struct PacketRegistry {
    capacity: usize,
    inner: Mutex<RegistryState>,
}

struct RegistryState {
    map: HashMap<PacketId, Arc<Packet>>,
    order: VecDeque<PacketId>,
}

impl PacketRegistry {
    pub fn new(capacity: usize) -> PacketRegistry {
        PacketRegistry {
            capacity: capacity.max(1),
            inner: Mutex::new(RegistryState {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn insert(&self, packet: Arc<Packet>) {
        let id = packet.id();
        let mut st = self.inner.lock().expect("registry lock poisoned");
        if st.map.insert(id.clone(), packet).is_none() {
            st.order.push_back(id);
        }
        while st.order.len() > self.capacity {
            if let Some(evicted) = st.order.pop_front() {
                st.map.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: &PacketId) -> Option<Arc<Packet>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .map
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// MetricTap
// ---------------------------------------------------------------------------

/// Couples a hub subscription to a reorder window, yielding a time-ordered
/// stream of sequenced metrics for inspectors.
pub struct MetricTap;

impl MetricTap {
    /// Subscribe to the hub and spawn the tap task. The returned channel
    /// yields metrics in non-decreasing device-time order per the window
    /// contract; it closes when the hub shuts down (after a final flush) or
    /// when the inspector side is dropped (the subscription is then
    /// released).
    pub fn spawn(
        hub: &Arc<Hub>,
        window: usize,
        buffer_capacity: usize,
        registry: Option<Arc<PacketRegistry>>,
    ) -> mpsc::Receiver<SequencedMetric> {
        let (handle, mut sub_rx) = hub.subscribe(buffer_capacity);
        let (tap_tx, tap_rx) = mpsc::channel(buffer_capacity.max(1));
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut reorder = ReorderWindow::new(window);
            while let Some(packet) = sub_rx.recv().await {
                if packet.error.is_some() {
                    continue;
                }
                if let Some(reg) = &registry {
                    reg.insert(packet.clone());
                }
                for metric in reorder.push(&packet) {
                    if tap_tx.send(metric).await.is_err() {
                        debug!("metric tap consumer dropped; stopping tap");
                        hub.close(&handle);
                        return;
                    }
                }
            }
            for metric in reorder.flush() {
                if tap_tx.send(metric).await.is_err() {
                    break;
                }
            }
            hub.close(&handle);
        });
        tap_rx
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
