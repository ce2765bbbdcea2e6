//! In-process queue with visibility-timeout semantics
//!
//! Behaves like SQS for the parts the worker depends on: received messages
//! are hidden until their deadline, unacknowledged messages reappear with a
//! fresh receipt handle, and acknowledging with a stale handle fails.

use super::{decode_message, object_created_body, NotificationQueue};
use crate::error::QueueError;
use async_trait::async_trait;
use event_schema::{ReceiptHandle, UploadEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct QueuedMessage {
    id: u64,
    body: String,
    receive_count: u32,
    receipt: Option<String>,
    invisible_until: Option<Instant>,
}

impl QueuedMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |deadline| deadline <= now)
    }
}

pub struct InMemoryQueue {
    messages: Mutex<Vec<QueuedMessage>>,
    arrivals: Notify,
    visibility_timeout: Duration,
    default_bucket: String,
    next_id: AtomicU64,
    next_receipt: AtomicU64,
    acked: AtomicU64,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration, default_bucket: impl Into<String>) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
            visibility_timeout,
            default_bucket: default_bucket.into(),
            next_id: AtomicU64::new(1),
            next_receipt: AtomicU64::new(1),
            acked: AtomicU64::new(0),
        }
    }

    /// Enqueue a raw message body; returns the message id
    pub fn send(&self, body: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().push(QueuedMessage {
            id,
            body: body.into(),
            receive_count: 0,
            receipt: None,
            invisible_until: None,
        });
        self.arrivals.notify_waiters();
        id
    }

    /// Enqueue the notification S3 would send for a new object
    pub fn send_object_created(&self, bucket: &str, key: &str) -> u64 {
        self.send(object_created_body(bucket, key))
    }

    /// Messages not yet acknowledged, visible or in flight
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages that can be received right now
    pub fn visible_len(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| m.is_visible(now))
            .count()
    }

    pub fn acked_count(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    /// How often the message has been handed out
    pub fn receive_count(&self, message_id: u64) -> Option<u32> {
        self.messages
            .lock()
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.receive_count)
    }

    /// Receive visible messages, hiding each one for the visibility timeout
    fn receive_visible(&self, max_messages: u32) -> (Vec<UploadEvent>, Option<Instant>) {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut events = Vec::new();
        let mut empty_ids = Vec::new();
        let mut received = 0;

        for message in messages.iter_mut() {
            if received >= max_messages {
                break;
            }
            if !message.is_visible(now) {
                continue;
            }

            let receipt = format!(
                "rh-{}-{}",
                message.id,
                self.next_receipt.fetch_add(1, Ordering::SeqCst)
            );
            message.receipt = Some(receipt.clone());
            message.receive_count += 1;
            message.invisible_until = Some(now + self.visibility_timeout);
            received += 1;

            let decoded = decode_message(
                &message.body,
                &ReceiptHandle::new(receipt),
                &self.default_bucket,
            );
            if decoded.is_empty() {
                empty_ids.push(message.id);
            }
            events.extend(decoded);
        }

        // Nothing to process in these; acknowledge on receipt
        if !empty_ids.is_empty() {
            messages.retain(|m| !empty_ids.contains(&m.id));
            self.acked
                .fetch_add(empty_ids.len() as u64, Ordering::SeqCst);
        }

        let next_visible = messages.iter().filter_map(|m| m.invisible_until).min();
        (events, next_visible)
    }
}

#[async_trait]
impl NotificationQueue for InMemoryQueue {
    async fn poll(&self, max_messages: u32, wait: Duration) -> Result<Vec<UploadEvent>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a concurrent send is not missed
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let (events, next_visible) = self.receive_visible(max_messages.max(1));
            if !events.is_empty() {
                return Ok(events);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible
                .filter(|t| *t > now)
                .map_or(deadline, |t| t.min(deadline));

            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut messages = self.messages.lock();
        let position = messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(receipt.as_str()))
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        messages.remove(position);
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        {
            let mut messages = self.messages.lock();
            let message = messages
                .iter_mut()
                .find(|m| m.receipt.as_deref() == Some(receipt.as_str()))
                .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
            message.invisible_until = None;
        }
        self.arrivals.notify_waiters();
        Ok(())
    }
}
