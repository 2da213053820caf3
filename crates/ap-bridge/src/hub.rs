//! Fan-out of [`BridgeMessage`]s to UI subscribers.
//!
//! Each subscriber owns a bounded mailbox. A full mailbox drops the message
//! for that subscriber only; the next snapshot carries the complete state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, trace};

use crate::protocol::BridgeMessage;

pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

type Mailbox = flume::Sender<Arc<BridgeMessage>>;

struct HubInner {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Mailbox>>,
}

impl HubInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Mailbox>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Outcome of one [`Hub::broadcast`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: usize,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = flume::bounded(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().insert(id, tx);
        debug!(subscriber = id, "hub subscriber registered");
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Returns `true` if the subscriber was registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        remove(&self.inner, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Offer `msg` to every mailbox without blocking.
    pub fn broadcast(&self, msg: BridgeMessage) -> BroadcastStats {
        let msg = Arc::new(msg);
        let targets: Vec<(u64, Mailbox)> = self
            .inner
            .subscribers()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut stats = BroadcastStats::default();
        let mut gone = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(msg.clone()) {
                Ok(()) => stats.delivered += 1,
                Err(flume::TrySendError::Full(_)) => {
                    trace!(subscriber = id, "mailbox full, dropping message");
                    stats.dropped += 1;
                }
                Err(flume::TrySendError::Disconnected(_)) => gone.push(id),
            }
        }
        if !gone.is_empty() {
            let mut subs = self.inner.subscribers();
            for id in &gone {
                subs.remove(id);
            }
            stats.disconnected = gone.len();
        }
        stats
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

fn remove(inner: &HubInner, id: u64) -> bool {
    let removed = inner.subscribers().remove(&id).is_some();
    if removed {
        debug!(subscriber = id, "hub subscriber removed");
    }
    removed
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving side of a hub mailbox. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: u64,
    rx: flume::Receiver<Arc<BridgeMessage>>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&self) -> Option<Arc<BridgeMessage>> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<Arc<BridgeMessage>> {
        self.rx.try_recv().ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            remove(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{events, EventPayload};

    fn event(n: usize) -> BridgeMessage {
        BridgeMessage::Event(EventPayload::for_project(
            events::TASK_CHANGED,
            "demo",
            format!("event {n}"),
        ))
    }

    #[test]
    fn full_mailbox_drops_without_blocking() {
        let hub = Hub::new(2);
        let slow = hub.subscribe();
        let stats: Vec<_> = (0..3).map(|n| hub.broadcast(event(n))).collect();
        assert_eq!(stats[2].dropped, 1);
        assert_eq!(slow.pending(), 2);
    }

    #[test]
    fn slow_subscriber_does_not_starve_others() {
        let hub = Hub::new(1);
        let _slow = hub.subscribe();
        let fast = hub.subscribe();
        for n in 0..3 {
            hub.broadcast(event(n));
            assert!(fast.try_recv().is_some());
        }
    }

    #[test]
    fn drop_unsubscribes() {
        let hub = Hub::default();
        let sub = hub.subscribe();
        let id = sub.id();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!hub.unsubscribe(id));
    }

    #[tokio::test]
    async fn async_receive() {
        let hub = Hub::default();
        let sub = hub.subscribe();
        hub.broadcast(event(1));
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.event_type(), Some("task_changed"));
    }
}
