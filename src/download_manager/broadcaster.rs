//! Fan-out of engine events to any number of subscribers.
//!
//! Every subscriber owns a bounded buffer. Publishing never waits: when a
//! subscriber's buffer is full the event is dropped for that subscriber only
//! and the drop counters are bumped. Subscribers that need a gap-free view
//! reconcile through a queue snapshot.

use super::models::ProgressEvent;
use crate::server::metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::debug;

/// Default per-subscriber buffer size.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

struct SubscriberSlot {
    id: u64,
    sender: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

pub struct ProgressBroadcaster {
    capacity: usize,
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_subscriber_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a new subscriber. Events published before this call are not replayed.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));

        self.subscribers.lock().unwrap().push(SubscriberSlot {
            id,
            sender,
            dropped: dropped.clone(),
        });
        debug!("Subscriber {} registered", id);

        Subscription {
            id,
            receiver,
            dropped,
        }
    }

    /// Delivers `event` to every live subscriber without blocking.
    pub fn publish(&self, event: ProgressEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|slot| match slot.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                slot.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_event_dropped();
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Subscriber {} went away, removing", slot.id);
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|slot| !slot.sender.is_closed());
        subscribers.len()
    }

    /// Total events dropped across all subscribers since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// Receiving end of a broadcaster subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event. Returns None once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Returns a buffered event if one is ready.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Events this subscriber missed because its buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download_manager::models::{ItemState, QueueCounts};
    use chrono::Utc;
    use std::time::{Duration, Instant};

    fn item_event(n: usize) -> ProgressEvent {
        ProgressEvent::Item {
            item_id: format!("item-{}", n),
            state: ItemState::Fetching,
            progress_fraction: 0.0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn overflowing_subscriber_drops_newest_without_blocking() {
        let broadcaster = ProgressBroadcaster::new(100);
        let mut subscription = broadcaster.subscribe();

        let start = Instant::now();
        for n in 0..150 {
            broadcaster.publish(item_event(n));
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        let mut received = Vec::new();
        while let Some(event) = subscription.try_recv() {
            received.push(event);
        }

        assert!(received.len() <= 100);
        assert_eq!(received.len(), 100);
        assert!(subscription.dropped_count() > 0);
        assert_eq!(subscription.dropped_count(), 50);
        assert_eq!(broadcaster.dropped_count(), 50);
        // Oldest events survive, newest were dropped.
        assert_eq!(received[0].item_id(), Some("item-0"));
        assert_eq!(received[99].item_id(), Some("item-99"));
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let broadcaster = ProgressBroadcaster::new(16);
        let mut subscription = broadcaster.subscribe();

        for n in 0..10 {
            broadcaster.publish(item_event(n));
        }

        for n in 0..10 {
            let event = subscription.recv().await.unwrap();
            assert_eq!(event.item_id(), Some(format!("item-{}", n).as_str()));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let broadcaster = ProgressBroadcaster::new(2);
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        for n in 0..4 {
            broadcaster.publish(item_event(n));
            assert!(fast.try_recv().is_some());
        }

        assert_eq!(fast.dropped_count(), 0);
        assert_eq!(slow.dropped_count(), 2);
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let broadcaster = ProgressBroadcaster::new(4);
        let subscription = broadcaster.subscribe();
        let _other = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(subscription);
        broadcaster.publish(ProgressEvent::QueueChanged {
            summary: QueueCounts::default(),
            timestamp: Utc::now(),
        });
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_new_events() {
        let broadcaster = ProgressBroadcaster::new(4);
        broadcaster.publish(item_event(0));

        let mut subscription = broadcaster.subscribe();
        assert!(subscription.try_recv().is_none());

        broadcaster.publish(item_event(1));
        assert_eq!(subscription.try_recv().unwrap().item_id(), Some("item-1"));
        assert_eq!(broadcaster.published_count(), 2);
    }
}
