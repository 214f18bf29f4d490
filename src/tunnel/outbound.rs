//! The outbound multiplexer queue.
//!
//! Every producer (dispatcher responses, watch callbacks, exec and log
//! bridges) hands envelopes to one [`Outbound`]; the tunnel writer is its only
//! consumer and the only code that touches the socket sink.
//!
//! The queue is bounded. When it is full the **oldest** envelope is evicted,
//! counted and logged, so a long disconnect costs the stalest output instead
//! of blocking informer callbacks or session bridges. `send` never blocks and
//! is callable from synchronous callbacks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::warn;

use crate::protocol::Envelope;

/// Cloneable handle to the shared FIFO of outbound envelopes.
#[derive(Clone)]
pub struct Outbound {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl Outbound {
    /// Create a queue holding at most `capacity` envelopes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
                capacity,
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue an envelope, evicting the oldest one if the queue is full.
    pub fn send(&self, envelope: Envelope) {
        let evicted = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if queue.len() >= self.inner.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(envelope);
            evicted
        };

        if let Some(old) = evicted {
            let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                res_type = ?old.res_type,
                request_id = %old.request_id,
                dropped_total = total,
                "Outbound queue full, dropped oldest envelope"
            );
        }
        // Single consumer: notify_one stores a permit if the writer is not
        // currently waiting, so a wakeup is never lost.
        self.inner.notify.notify_one();
    }

    /// Wait for the next envelope in FIFO order.
    pub async fn recv(&self) -> Envelope {
        loop {
            if let Some(envelope) = self.try_recv() {
                return envelope;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Number of envelopes waiting to be written.
    pub fn len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Envelopes evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
