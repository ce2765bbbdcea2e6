//! SQS-backed notification queue

use super::{decode_message, NotificationQueue};
use crate::error::QueueError;
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use event_schema::{ReceiptHandle, UploadEvent};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest long-poll SQS accepts
const MAX_WAIT_SECS: u64 = 20;

#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    default_bucket: String,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: impl Into<String>, default_bucket: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            default_bucket: default_bucket.into(),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait]
impl NotificationQueue for SqsQueue {
    async fn poll(&self, max_messages: u32, wait: Duration) -> Result<Vec<UploadEvent>, QueueError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, 10) as i32)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECS) as i32)
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let mut events = Vec::new();
        for message in response.messages() {
            let Some(handle) = message.receipt_handle() else {
                warn!(message_id = ?message.message_id(), "Message without receipt handle");
                continue;
            };
            let receipt = ReceiptHandle::new(handle);
            let decoded = decode_message(message.body().unwrap_or_default(), &receipt, &self.default_bucket);

            if decoded.is_empty() {
                // Nothing to process (test events, malformed bodies); delete it
                if let Err(e) = self.ack(&receipt).await {
                    warn!(error = %e, "Failed to delete empty queue message");
                }
                continue;
            }
            events.extend(decoded);
        }

        debug!(received = events.len(), "Polled upload queue");
        Ok(events)
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt.as_str())
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt.as_str())
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
