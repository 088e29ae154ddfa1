//! The notification seam between the wallet and its indexers.
//!
//! The wallet publishes small JSON messages (new lockers, new records)
//! into topics; scanners and index writers subscribe. The broadcaster
//! implementation lives with the wallet orchestration; only the interface
//! is defined here.

use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// A message delivered to a topic subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub topic: String,
    pub payload: Value,
}

/// Delivery mode of a publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Backpressured: block until every targeted subscriber has received
    /// the message
    Wait,
    /// Best-effort: drop the message for any subscriber that is not ready
    Try,
}

/// Identifier of an active subscription
pub type SubscriptionId = u64;

/// Topic-based pub/sub as consumed by the wallet
pub trait NotificationService: Send + Sync {
    /// Publishes a message to the given topics
    ///
    /// With `broadcast`, every subscriber of each topic receives the
    /// message; otherwise a single subscriber per topic does.
    fn publish(
        &self,
        payload: &Value,
        mode: PublishMode,
        broadcast: bool,
        topics: &[String],
    ) -> Result<()>;
    /// Subscribes to the given topics
    fn subscribe(&self, topics: &[String]) -> Result<(SubscriptionId, Receiver<NotificationMessage>)>;
    /// Removes a subscription from the given topics
    fn unsubscribe(&self, subscription: SubscriptionId, topics: &[String]) -> Result<()>;
    /// Closes the topics entirely, dropping all their subscribers
    fn close_topics(&self, topics: &[String]) -> Result<()>;
}
