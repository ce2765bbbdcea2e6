//! SNS-backed notification topic

use super::NotificationTopic;
use crate::error::PublishError;
use async_trait::async_trait;
use aws_sdk_sns::Client;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

/// Publishes to SNS topics, resolving names to ARNs on first use
#[derive(Clone)]
pub struct SnsTopic {
    client: Client,
    arns: std::sync::Arc<RwLock<HashMap<String, String>>>,
}

impl SnsTopic {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            arns: Default::default(),
        }
    }

    /// Create (idempotently) the topic and cache its ARN
    pub async fn resolve(&self, topic: &str) -> Result<String, PublishError> {
        if let Some(arn) = self.arns.read().get(topic) {
            return Ok(arn.clone());
        }

        let response = self
            .client
            .create_topic()
            .name(topic)
            .send()
            .await
            .map_err(|e| PublishError::Unreachable(e.to_string()))?;

        let arn = response
            .topic_arn()
            .ok_or_else(|| PublishError::Unreachable(format!("no ARN returned for topic {topic}")))?
            .to_string();

        info!(topic = %topic, arn = %arn, "Resolved notification topic");
        self.arns.write().insert(topic.to_string(), arn.clone());
        Ok(arn)
    }
}

#[async_trait]
impl NotificationTopic for SnsTopic {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        let arn = self.resolve(topic).await?;

        let response = self
            .client
            .publish()
            .topic_arn(&arn)
            .message(payload)
            .send()
            .await
            .map_err(|e| PublishError::Unreachable(e.to_string()))?;

        debug!(topic = %topic, message_id = ?response.message_id(), "Published notification");
        Ok(())
    }
}
