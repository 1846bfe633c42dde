use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::model::SensorReading;

/// Depth of each subscriber's buffer; a consumer that falls further behind
/// than this starts losing readings rather than stalling ingest.
const SUBSCRIBER_BUFFER: usize = 64;

/// In-process fan-out of readings to every connected stream subscriber.
///
/// Wrapped in `Arc` so it can be cheaply cloned and shared across tasks.
/// `publish` never blocks: delivery to a full subscriber is dropped.
#[derive(Clone, Default)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<SensorReading>>>,
}

/// Opaque unsubscribe capability; dropping it removes the subscription and
/// closes the subscriber's channel. Idempotent by construction.
pub struct SubscriberGuard {
    hub: Arc<HubInner>,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.hub.subscribers.write().remove(&self.id);
    }
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. The receiver yields readings in publish
    /// order; it ends once the guard is dropped.
    pub fn subscribe(&self) -> (mpsc::Receiver<SensorReading>, SubscriberGuard) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().insert(id, sender);

        let guard = SubscriberGuard {
            hub: Arc::clone(&self.inner),
            id,
        };
        (receiver, guard)
    }

    /// Deliver `reading` to every current subscriber without blocking.
    /// Subscribers whose receiver has gone away are pruned.
    pub fn publish(&self, reading: SensorReading) {
        let senders: Vec<(u64, mpsc::Sender<SensorReading>)> = {
            let subscribers = self.inner.subscribers.read();
            subscribers
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect()
        };

        let mut stale = Vec::new();
        for (id, sender) in senders {
            match sender.try_send(reading) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => stale.push(id),
            }
        }

        if !stale.is_empty() {
            let mut subscribers = self.inner.subscribers.write();
            for id in stale {
                subscribers.remove(&id);
            }
        }
    }

    #[allow(dead_code)]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}
