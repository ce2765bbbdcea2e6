//! Notification topic port
//!
//! Fan-out pub/sub endpoint the completion events are published to.

use crate::error::PublishError;
use async_trait::async_trait;

pub mod memory;
pub mod sns;

pub use memory::InMemoryTopic;
pub use sns::SnsTopic;

#[async_trait]
pub trait NotificationTopic: Send + Sync {
    /// Publish one payload; `topic` is a topic name
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError>;
}
