//! SNS operations used by the live-update service
//!
//! Handlers only need to confirm subscriptions, so that is the port they
//! depend on. Topic and subscription provisioning happen at startup.

use crate::error::AppError;
use async_trait::async_trait;
use aws_sdk_sns::Client;
use parking_lot::Mutex;
use resilience::timeout::with_timeout_result;
use std::time::Duration;
use tracing::info;

/// SNS waits only briefly for a confirmation; startup provisioning shares the deadline
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait SubscriptionConfirmer: Send + Sync {
    async fn confirm(&self, topic_arn: &str, token: &str) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct SnsGateway {
    client: Client,
    call_timeout: Duration,
}

impl SnsGateway {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Deadline applied to every SNS call
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Create (idempotently) the topic and return its ARN
    pub async fn ensure_topic(&self, name: &str) -> Result<String, AppError> {
        let request = self.client.create_topic().name(name).send();
        let response = with_timeout_result(self.call_timeout, request)
            .await
            .map_err(|e| AppError::Upstream(format!("create_topic {name}: {e}")))?;

        response
            .topic_arn()
            .map(str::to_string)
            .ok_or_else(|| AppError::Upstream(format!("no ARN returned for topic {name}")))
    }

    /// Subscribe `endpoint` over HTTP unless it already is
    pub async fn ensure_http_subscription(
        &self,
        topic_arn: &str,
        endpoint: &str,
    ) -> Result<(), AppError> {
        let mut next_token: Option<String> = None;
        loop {
            let request = self
                .client
                .list_subscriptions_by_topic()
                .topic_arn(topic_arn)
                .set_next_token(next_token.take())
                .send();
            let page = with_timeout_result(self.call_timeout, request)
                .await
                .map_err(|e| AppError::Upstream(format!("list_subscriptions_by_topic: {e}")))?;

            let exists = page
                .subscriptions()
                .iter()
                .any(|sub| sub.endpoint() == Some(endpoint));
            if exists {
                return Ok(());
            }

            match page.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        let protocol = if endpoint.starts_with("https://") {
            "https"
        } else {
            "http"
        };
        let request = self
            .client
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(protocol)
            .endpoint(endpoint)
            .send();
        with_timeout_result(self.call_timeout, request)
            .await
            .map_err(|e| AppError::Upstream(format!("subscribe {endpoint}: {e}")))?;

        info!(topic_arn = %topic_arn, endpoint = %endpoint, "Subscribed live-update endpoint");
        Ok(())
    }
}

#[async_trait]
impl SubscriptionConfirmer for SnsGateway {
    async fn confirm(&self, topic_arn: &str, token: &str) -> Result<(), AppError> {
        let request = self
            .client
            .confirm_subscription()
            .topic_arn(topic_arn)
            .token(token)
            .send();
        with_timeout_result(self.call_timeout, request)
            .await
            .map_err(|e| AppError::Upstream(format!("confirm_subscription: {e}")))?;

        info!(topic_arn = %topic_arn, "Confirmed SNS subscription");
        Ok(())
    }
}

/// Records confirmations instead of calling SNS
#[derive(Default)]
pub struct RecordingConfirmer {
    confirmed: Mutex<Vec<(String, String)>>,
}

impl RecordingConfirmer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(topic_arn, token)` pairs in call order
    pub fn confirmed(&self) -> Vec<(String, String)> {
        self.confirmed.lock().clone()
    }
}

#[async_trait]
impl SubscriptionConfirmer for RecordingConfirmer {
    async fn confirm(&self, topic_arn: &str, token: &str) -> Result<(), AppError> {
        self.confirmed
            .lock()
            .push((topic_arn.to_string(), token.to_string()));
        Ok(())
    }
}
