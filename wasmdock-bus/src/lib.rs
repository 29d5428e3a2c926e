//! wasmdock-bus: in-process publish/subscribe with per-topic fan-out.
//!
//! Every subscription owns a FIFO queue drained by a dedicated worker, so
//! publishing never runs a handler synchronously on the publishing thread.
//! That matters when both sides live inside WASM sandboxes: a publisher must
//! never observe its own memory being mutated from within its own call.
//!
//! Publishing is total: no back-pressure, no error. A publish to a topic
//! without subscribers is a no-op. Handler panics are contained per
//! subscription and neither unsubscribe other handlers nor stop the bus.
//!
//! Workers run on the Tokio blocking pool; the bus must be used from within
//! a Tokio runtime.
//!
//! ```rust,ignore
//! let bus = Bus::new();
//! let sub = bus.subscribe("events", |msg| println!("{:?}", msg.payload));
//! bus.publish("events", Message::new(b"hello".to_vec()));
//! sub.cancel();
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;

/// An opaque payload travelling over the bus. Immutable once published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

struct SubEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

struct BusInner {
    topics: RwLock<HashMap<String, Vec<SubEntry>>>,
    next_id: AtomicU64,
}

/// The shared pub/sub fabric. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Delivers `msg` to every handler currently registered on `topic`.
    ///
    /// Returns after enqueueing; handlers execute later on worker threads.
    /// Delivery is at-most-once per (publish, handler) and FIFO per handler.
    pub fn publish(&self, topic: &str, msg: Message) {
        let topics = self.inner.topics.read();
        let Some(entries) = topics.get(topic) else {
            return;
        };
        for entry in entries {
            // A closed receiver means the worker already exited; the entry
            // is removed on cancel, so a failed send is just a late race.
            let _ = entry.tx.send(msg.clone());
        }
    }

    /// Registers `handler` on `topic` and returns its cancellation handle.
    ///
    /// The handler may be invoked from worker threads and may block (guest
    /// calls routinely do). Dropping the returned [`Subscription`] does NOT
    /// cancel it; call [`Subscription::cancel`].
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(Message) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let worker_topic = topic.to_string();

        tokio::task::spawn_blocking(move || {
            while let Some(msg) = rx.blocking_recv() {
                // Checked immediately before each invocation: no handler
                // starts after cancel() has returned.
                if flag.load(Ordering::Acquire) {
                    break;
                }
                if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                    tracing::warn!(topic = %worker_topic, "bus handler panicked");
                }
            }
        });

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(SubEntry { id, tx });

        Subscription {
            topic: topic.to_string(),
            id,
            cancelled,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one active `(topic, handler)` registration.
pub struct Subscription {
    topic: String,
    id: u64,
    cancelled: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Cancels the subscription. Idempotent; once this returns no new
    /// invocation of the handler begins (an invocation already underway is
    /// allowed to finish).
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut topics = inner.topics.write();
        if let Some(entries) = topics.get_mut(&self.topic) {
            // Dropping the sender lets the worker drain out and exit.
            entries.retain(|entry| entry.id != self.id);
            if entries.is_empty() {
                topics.remove(&self.topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test(flavor = "multi_thread")]
    async fn test_publish_reaches_subscriber() {
        let bus = Bus::new();
        let (tx, rx) = std_mpsc::channel();
        let _sub = bus.subscribe("events", move |msg| {
            tx.send(msg.payload).unwrap();
        });

        bus.publish("events", Message::new(b"hello".to_vec()));
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_per_handler() {
        let bus = Bus::new();
        let (tx, rx) = std_mpsc::channel();
        let _sub = bus.subscribe("seq", move |msg| {
            tx.send(msg.payload).unwrap();
        });

        for i in 0u8..10 {
            bus.publish("seq", Message::new(vec![i]));
        }
        for i in 0u8..10 {
            assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), vec![i]);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_delivery_after_cancel() {
        let bus = Bus::new();
        let (tx, rx) = std_mpsc::channel();
        let sub = bus.subscribe("events", move |msg| {
            tx.send(msg.payload).unwrap();
        });

        bus.publish("events", Message::new(b"before".to_vec()));
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"before");

        sub.cancel();
        sub.cancel(); // idempotent
        assert_eq!(bus.subscriber_count("events"), 0);

        bus.publish("events", Message::new(b"after".to_vec()));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = Bus::new();
        bus.publish("nobody", Message::new(b"dropped".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handler_panic_is_contained() {
        let bus = Bus::new();
        let (tx, rx) = std_mpsc::channel();

        let _panicky = bus.subscribe("events", |_msg| {
            panic!("handler blew up");
        });
        let _sub = bus.subscribe("events", move |msg| {
            tx.send(msg.payload).unwrap();
        });

        bus.publish("events", Message::new(b"one".to_vec()));
        bus.publish("events", Message::new(b"two".to_vec()));

        // The healthy subscriber sees every message despite its neighbor
        // panicking on each delivery.
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"one");
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"two");
        assert_eq!(bus.subscriber_count("events"), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_independent_topics() {
        let bus = Bus::new();
        let (tx_a, rx_a) = std_mpsc::channel();
        let (tx_b, rx_b) = std_mpsc::channel();
        let _a = bus.subscribe("a", move |msg| {
            tx_a.send(msg.payload).unwrap();
        });
        let _b = bus.subscribe("b", move |msg| {
            tx_b.send(msg.payload).unwrap();
        });

        bus.publish("a", Message::new(b"for-a".to_vec()));
        assert_eq!(rx_a.recv_timeout(RECV_TIMEOUT).unwrap(), b"for-a");
        assert!(rx_b.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
