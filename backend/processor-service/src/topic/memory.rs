use super::NotificationTopic;
use crate::error::PublishError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

/// Subscriber queue depth; a full subscriber makes `publish` fail
const SUBSCRIBER_BUFFER: usize = 1024;

/// In-process topic delivering payloads to channel subscribers
#[derive(Default)]
pub struct InMemoryTopic {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    published: Mutex<Vec<(String, String)>>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

impl InMemoryTopic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Payloads successfully published to `topic`
    pub fn published(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Make the next `n` publish calls fail as unreachable
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Publish calls made so far, failed ones included
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationTopic for InMemoryTopic {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PublishError::Unreachable("injected publish failure".to_string()));
        }

        {
            let mut subscribers = self.subscribers.lock();
            if let Some(senders) = subscribers.get_mut(topic) {
                senders.retain(|tx| !tx.is_closed());
                for tx in senders.iter() {
                    tx.try_send(payload.to_string())
                        .map_err(|e| PublishError::Unreachable(e.to_string()))?;
                }
            }
        }

        self.published
            .lock()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}
