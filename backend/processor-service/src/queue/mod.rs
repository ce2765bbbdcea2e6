//! Notification queue port
//!
//! At-least-once, pull-based delivery of "object created" notifications.
//! A received message stays invisible to other consumers until it is
//! acknowledged or its visibility timeout expires.

use crate::error::QueueError;
use async_trait::async_trait;
use event_schema::{parse_object_created, ReceiptHandle, UploadEvent};
use std::time::Duration;
use tracing::warn;

pub mod memory;
pub mod sqs;

pub use memory::InMemoryQueue;
pub use sqs::SqsQueue;

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Wait up to `wait` for at most `max_messages` messages
    ///
    /// One message may carry several records; every `UploadEvent` produced
    /// from it shares the message's receipt handle.
    async fn poll(&self, max_messages: u32, wait: Duration) -> Result<Vec<UploadEvent>, QueueError>;

    /// Delete the message for good
    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Make the message visible again right away
    async fn nack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;
}

/// Turn one raw message body into upload events
///
/// Keys are qualified with their bucket (`uploads/photo1.png`) so the ledger
/// key is unique across buckets. Returns an empty list for bodies that carry
/// nothing to process; the caller acknowledges those right away.
pub(crate) fn decode_message(
    body: &str,
    receipt: &ReceiptHandle,
    default_bucket: &str,
) -> Vec<UploadEvent> {
    let records = match parse_object_created(body) {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, receipt = %receipt, "Discarding unparseable queue message");
            return Vec::new();
        }
    };

    if records.is_empty() {
        warn!(receipt = %receipt, "Queue message has no object records");
    }

    records
        .into_iter()
        .map(|record| {
            let bucket = record.bucket.unwrap_or_else(|| default_bucket.to_string());
            let object_key = format!("{}/{}", bucket, record.key);
            UploadEvent::new(object_key, bucket, receipt.clone())
        })
        .collect()
}

/// Build an S3 event-notification body for one created object
pub fn object_created_body(bucket: &str, key: &str) -> String {
    serde_json::json!({
        "Records": [{
            "eventSource": "aws:s3",
            "eventName": "ObjectCreated:Put",
            "s3": {
                "bucket": { "name": bucket },
                "object": { "key": key }
            }
        }]
    })
    .to_string()
}
