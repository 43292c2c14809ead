//! Publish/subscribe channel for engine notifications.
//!
//! Any number of subscribers; publishing never blocks and never fails when nobody listens.

use crate::domain::BackupEvent;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: BackupEvent) {
        match self.tx.send(event) {
            Ok(n) => debug!(subscribers = n, "event published"),
            Err(_) => debug!("event published with no subscribers"),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription. Dropping it or calling `unsubscribe` detaches it.
pub struct Subscription {
    rx: broadcast::Receiver<BackupEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone. Lagged subscribers skip ahead.
    pub async fn recv(&mut self) -> Option<BackupEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; dropping old events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<BackupEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(BackupEvent::ReloadRequested);

        assert_eq!(a.recv().await, Some(BackupEvent::ReloadRequested));
        assert_eq!(b.recv().await, Some(BackupEvent::ReloadRequested));
    }

    #[tokio::test]
    async fn unsubscribe_detaches() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        a.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(BackupEvent::ReloadRequested);
        assert_eq!(b.try_recv(), Some(BackupEvent::ReloadRequested));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new().publish(BackupEvent::ReloadRequested);
    }
}
