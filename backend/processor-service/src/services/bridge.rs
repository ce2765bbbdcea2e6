//! Publish/notify bridge
//!
//! Receives completion events from workers and publishes them to the
//! notification topic with bounded retry. A notification that cannot be
//! delivered is logged and dropped; the processed object stays in place.

use crate::config::PublishConfig;
use crate::error::PublishError;
use crate::metrics;
use crate::topic::NotificationTopic;
use event_schema::CompletionEvent;
use resilience::{with_retry_if, RetryConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Buffer between workers and the bridge
pub const HANDOFF_BUFFER: usize = 256;

pub struct PublishBridge {
    topic: Arc<dyn NotificationTopic>,
    topic_name: String,
    retry: RetryConfig,
}

impl PublishBridge {
    pub fn new(
        topic: Arc<dyn NotificationTopic>,
        topic_name: impl Into<String>,
        config: &PublishConfig,
    ) -> Self {
        let retry = RetryConfig {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            ..resilience::notification_publish_config().retry
        };

        Self {
            topic,
            topic_name: topic_name.into(),
            retry,
        }
    }

    /// Publish one event, retrying unreachable-backend failures
    pub async fn publish(&self, event: &CompletionEvent) -> Result<(), PublishError> {
        let payload = event
            .to_json()
            .map_err(|e| PublishError::InvalidPayload(e.to_string()))?;

        with_retry_if(
            self.retry.clone(),
            PublishError::is_retryable,
            || self.topic.publish(&self.topic_name, &payload),
        )
        .await
        .map_err(|e| e.into_inner())
    }

    /// Drain the hand-off channel until every sender is gone
    pub async fn run(self, mut rx: mpsc::Receiver<CompletionEvent>) {
        info!(topic = %self.topic_name, "Publish bridge started");

        while let Some(event) = rx.recv().await {
            match self.publish(&event).await {
                Ok(()) => {
                    metrics::record_completion_event("published");
                    debug!(
                        object_key = %event.object_key,
                        processed_key = %event.processed_key,
                        "Completion event published"
                    );
                }
                Err(e) => {
                    metrics::record_completion_event("dropped");
                    error!(
                        object_key = %event.object_key,
                        processed_key = %event.processed_key,
                        error = %e,
                        "Dropping completion event after publish failures"
                    );
                }
            }
        }

        info!("Publish bridge stopped");
    }
}

/// Create the channel workers hand completion events through
pub fn handoff_channel() -> (mpsc::Sender<CompletionEvent>, mpsc::Receiver<CompletionEvent>) {
    mpsc::channel(HANDOFF_BUFFER)
}
