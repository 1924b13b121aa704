//! Single-producer, many-subscriber broadcast hub.
//!
//! Each subscriber owns an independent bounded buffer; a full buffer drops
//! its own oldest entry and never blocks the producer or disturbs other
//! subscribers. Packets published before a subscription are not replayed.

use crate::frame::Packet;
use crate::queue::{self, PushOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Outcome of a publish, reported to the producer for accounting only,
/// never as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered to `delivered` subscribers, displacing the oldest entry in
    /// `dropped` of them.
    Delivered { delivered: usize, dropped: usize },
    /// The hub is shut down; the packet was discarded.
    Closed,
}

/// Identifies one subscription; used to close it and read its drop counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle {
    id: u64,
}

struct HubState {
    subscribers: HashMap<u64, queue::Sender<Arc<Packet>>>,
    next_id: u64,
    closed: bool,
}

/// The broadcast hub.
pub struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub {
            state: Mutex::new(HubState {
                subscribers: HashMap::new(),
                next_id: 0,
                closed: false,
            }),
        }
    }

    /// Register a new subscriber with its own buffer of `capacity` packets.
    ///
    /// Only packets published after this call are delivered. Subscribing to
    /// a shut-down hub yields a receiver that reports closed immediately.
    pub fn subscribe(&self, capacity: usize) -> (SubscriberHandle, queue::Receiver<Arc<Packet>>) {
        let (tx, rx) = queue::bounded(capacity);
        let mut st = self.state.lock().expect("hub lock poisoned");
        let id = st.next_id;
        st.next_id += 1;
        if st.closed {
            tx.close();
        } else {
            st.subscribers.insert(id, tx);
        }
        (SubscriberHandle { id }, rx)
    }

    /// Deliver a packet to every live subscriber. Never blocks and never
    /// fails: slow subscribers lose their own oldest entry.
    pub fn publish(&self, packet: Arc<Packet>) -> PublishOutcome {
        let st = self.state.lock().expect("hub lock poisoned");
        if st.closed {
            return PublishOutcome::Closed;
        }
        let mut delivered = 0;
        let mut dropped = 0;
        for tx in st.subscribers.values() {
            match tx.push(packet.clone()) {
                PushOutcome::Delivered => delivered += 1,
                PushOutcome::DroppedOldest => {
                    delivered += 1;
                    dropped += 1;
                }
                PushOutcome::Closed => {}
            }
        }
        PublishOutcome::Delivered { delivered, dropped }
    }

    /// Remove a subscriber, discarding anything still buffered for it.
    /// Idempotent; unknown handles are ignored.
    pub fn close(&self, handle: &SubscriberHandle) {
        let tx = {
            let mut st = self.state.lock().expect("hub lock poisoned");
            st.subscribers.remove(&handle.id)
        };
        if let Some(tx) = tx {
            tx.close_and_clear();
        }
    }

    /// Shut the hub down: refuse further publishes and close every
    /// subscriber. Buffered packets stay retrievable so subscribers can
    /// drain before observing the close.
    pub fn close_hub(&self) {
        let subscribers = {
            let mut st = self.state.lock().expect("hub lock poisoned");
            st.closed = true;
            std::mem::take(&mut st.subscribers)
        };
        for tx in subscribers.values() {
            tx.close();
        }
    }

    /// Packets displaced from this subscriber's buffer so far, or `None`
    /// for a handle that is no longer live.
    pub fn dropped(&self, handle: &SubscriberHandle) -> Option<u64> {
        let st = self.state.lock().expect("hub lock poisoned");
        st.subscribers.get(&handle.id).map(|tx| tx.dropped())
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().expect("hub lock poisoned").subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("hub lock poisoned").closed
    }
}

impl Default for Hub {
    fn default() -> Hub {
        Hub::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
