//! Bounded drop-oldest queues.
//!
//! Every inter-stage handoff in the pipeline uses this primitive: a bounded
//! FIFO whose producer side never blocks. When the queue is full the oldest
//! item is dropped (and counted) so the producer always makes progress and a
//! slow consumer only loses its own history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Outcome of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued without displacing anything.
    Delivered,
    /// Enqueued, displacing the oldest queued item.
    DroppedOldest,
    /// The queue is closed; the item was discarded.
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    capacity: usize,
}

/// Producer side. Cloneable; all clones feed the same queue.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            inner: self.inner.clone(),
        }
    }
}

/// Consumer side; single consumer per queue.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

/// Create a bounded drop-oldest queue. `capacity` is clamped to at least 1.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            items: VecDeque::new(),
            closed: false,
            dropped: 0,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

impl<T> Sender<T> {
    /// Enqueue without blocking; drops the oldest queued item when full.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut st = self.inner.state.lock().expect("queue lock poisoned");
            if st.closed {
                return PushOutcome::Closed;
            }
            if st.items.len() >= self.inner.capacity {
                st.items.pop_front();
                st.dropped += 1;
                st.items.push_back(item);
                PushOutcome::DroppedOldest
            } else {
                st.items.push_back(item);
                PushOutcome::Delivered
            }
        };
        self.inner.notify.notify_one();
        outcome
    }

    /// Close the queue. Queued items remain retrievable; `recv` returns
    /// `None` once they are drained. Idempotent.
    pub fn close(&self) {
        {
            let mut st = self.inner.state.lock().expect("queue lock poisoned");
            st.closed = true;
        }
        self.inner.notify.notify_waiters();
    }

    /// Close the queue and discard everything still buffered.
    pub fn close_and_clear(&self) {
        {
            let mut st = self.inner.state.lock().expect("queue lock poisoned");
            st.closed = true;
            st.items.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Number of items displaced so far.
    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().expect("queue lock poisoned").dropped
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("queue lock poisoned").closed
    }
}

impl<T> Receiver<T> {
    /// Await the next item. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut st = self.inner.state.lock().expect("queue lock poisoned");
                if let Some(item) = st.items.pop_front() {
                    return Some(item);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant: `Some` if an item is ready, `None` otherwise
    /// (including when closed).
    pub fn try_recv(&mut self) -> Option<T> {
        self.inner
            .state
            .lock()
            .expect("queue lock poisoned")
            .items
            .pop_front()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
