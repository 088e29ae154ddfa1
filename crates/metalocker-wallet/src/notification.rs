//! A single-process notification broadcaster.
//!
//! One broadcaster, per-topic subscriber channels. Publishing can be
//! backpressured (`Wait`) or best-effort (`Try`); subscribers receive
//! through bounded std channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use metalocker::notification::{
    NotificationMessage, NotificationService, PublishMode, SubscriptionId,
};
use metalocker::Result;
use serde_json::Value;

/// Buffered messages per subscriber channel
const CHANNEL_CAPACITY: usize = 64;

struct Subscriber {
    id: SubscriptionId,
    sender: SyncSender<NotificationMessage>,
}

/// An in-process [`NotificationService`]
#[derive(Default)]
pub struct LocalNotificationService {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl LocalNotificationService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationService for LocalNotificationService {
    fn publish(
        &self,
        payload: &Value,
        mode: PublishMode,
        broadcast: bool,
        topics: &[String],
    ) -> Result<()> {
        let mut registry = self
            .topics
            .lock()
            .expect("the broadcaster mutex is never poisoned");
        for topic in topics {
            let Some(subscribers) = registry.get_mut(topic) else {
                continue;
            };
            let message = NotificationMessage {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            let mut disconnected = Vec::new();
            let targets = if broadcast {
                subscribers.iter().collect::<Vec<_>>()
            } else {
                subscribers.iter().take(1).collect()
            };
            for subscriber in targets {
                match mode {
                    PublishMode::Wait => {
                        if subscriber.sender.send(message.clone()).is_err() {
                            disconnected.push(subscriber.id);
                        }
                    }
                    PublishMode::Try => match subscriber.sender.try_send(message.clone()) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => disconnected.push(subscriber.id),
                    },
                }
            }
            subscribers.retain(|s| !disconnected.contains(&s.id));
        }
        Ok(())
    }

    fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<(SubscriptionId, Receiver<NotificationMessage>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = sync_channel(CHANNEL_CAPACITY);
        let mut registry = self
            .topics
            .lock()
            .expect("the broadcaster mutex is never poisoned");
        for topic in topics {
            registry.entry(topic.clone()).or_default().push(Subscriber {
                id,
                sender: sender.clone(),
            });
        }
        Ok((id, receiver))
    }

    fn unsubscribe(&self, subscription: SubscriptionId, topics: &[String]) -> Result<()> {
        let mut registry = self
            .topics
            .lock()
            .expect("the broadcaster mutex is never poisoned");
        for topic in topics {
            if let Some(subscribers) = registry.get_mut(topic) {
                subscribers.retain(|s| s.id != subscription);
            }
        }
        Ok(())
    }

    fn close_topics(&self, topics: &[String]) -> Result<()> {
        let mut registry = self
            .topics
            .lock()
            .expect("the broadcaster mutex is never poisoned");
        for topic in topics {
            registry.remove(topic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_reaches_all_subscribers() {
        let service = LocalNotificationService::new();
        let topics = vec!["lockers".to_owned()];
        let (_id1, rx1) = service.subscribe(&topics).unwrap();
        let (_id2, rx2) = service.subscribe(&topics).unwrap();

        service
            .publish(&json!({"event": "AddLocker"}), PublishMode::Wait, true, &topics)
            .unwrap();

        assert_eq!(rx1.recv().unwrap().payload["event"], "AddLocker");
        assert_eq!(rx2.recv().unwrap().payload["event"], "AddLocker");
    }

    #[test]
    fn single_delivery_targets_one_subscriber() {
        let service = LocalNotificationService::new();
        let topics = vec!["queue".to_owned()];
        let (_id1, rx1) = service.subscribe(&topics).unwrap();
        let (_id2, rx2) = service.subscribe(&topics).unwrap();

        service
            .publish(&json!(1), PublishMode::Wait, false, &topics)
            .unwrap();

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn try_mode_drops_when_full() {
        let service = LocalNotificationService::new();
        let topics = vec!["busy".to_owned()];
        let (_id, rx) = service.subscribe(&topics).unwrap();

        for i in 0..(CHANNEL_CAPACITY + 10) {
            service
                .publish(&json!(i), PublishMode::Try, true, &topics)
                .unwrap();
        }
        // The channel holds at most its capacity; the rest were dropped
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CHANNEL_CAPACITY);
    }

    #[test]
    fn unsubscribe_and_close_stop_delivery() {
        let service = LocalNotificationService::new();
        let topics = vec!["t".to_owned()];
        let (id, rx) = service.subscribe(&topics).unwrap();
        service.unsubscribe(id, &topics).unwrap();
        service
            .publish(&json!("x"), PublishMode::Wait, true, &topics)
            .unwrap();
        assert!(rx.try_recv().is_err());

        let (_id, rx) = service.subscribe(&topics).unwrap();
        service.close_topics(&topics).unwrap();
        service
            .publish(&json!("y"), PublishMode::Wait, true, &topics)
            .unwrap();
        assert!(rx.recv().is_err());
    }
}
