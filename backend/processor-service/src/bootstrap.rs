//! Infrastructure bootstrap
//!
//! Makes sure the buckets, the upload queue (with the bucket notifying it)
//! and the completion topic exist. Emulators such as LocalStack often come
//! up after the worker, so provisioning is retried until it succeeds.

use crate::config::{PipelineConfig, WorkerConfig};
use crate::topic::SnsTopic;
use anyhow::{anyhow, Context};
use aws_sdk_s3::types::{Event, NotificationConfiguration, QueueConfiguration};
use aws_sdk_sqs::types::QueueAttributeName;
use object_store::{ObjectStore, S3ObjectStore};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Delay between provisioning attempts
pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Resources the worker needs at runtime
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub queue_url: String,
    pub queue_arn: String,
    pub topic_arn: String,
}

pub struct InfrastructureBootstrap {
    store: S3ObjectStore,
    sqs: aws_sdk_sqs::Client,
    topic: SnsTopic,
    pipeline: PipelineConfig,
    visibility_timeout: Duration,
    long_poll: Duration,
}

impl InfrastructureBootstrap {
    pub fn new(
        store: S3ObjectStore,
        sqs: aws_sdk_sqs::Client,
        topic: SnsTopic,
        pipeline: PipelineConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            sqs,
            topic,
            pipeline,
            visibility_timeout: worker.visibility_timeout,
            long_poll: worker.poll_wait,
        }
    }

    /// Provision everything once
    pub async fn ensure_all(&self) -> anyhow::Result<Provisioned> {
        for bucket in [&self.pipeline.upload_bucket, &self.pipeline.output_bucket] {
            self.store
                .ensure_bucket(bucket)
                .await
                .with_context(|| format!("ensuring bucket {bucket}"))?;
        }

        let (queue_url, queue_arn) = self.ensure_upload_queue().await?;
        self.configure_upload_notifications(&queue_arn).await?;

        let topic_arn = self
            .topic
            .resolve(&self.pipeline.processed_topic_name)
            .await
            .context("ensuring processed topic")?;

        Ok(Provisioned {
            queue_url,
            queue_arn,
            topic_arn,
        })
    }

    /// Retry provisioning until it succeeds; `None` if shutdown came first
    pub async fn run_until_ready(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Option<Provisioned> {
        loop {
            if *shutdown_rx.borrow() {
                return None;
            }

            match self.ensure_all().await {
                Ok(provisioned) => {
                    info!(
                        queue_url = %provisioned.queue_url,
                        topic_arn = %provisioned.topic_arn,
                        "Infrastructure ready"
                    );
                    return Some(provisioned);
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Provisioning failed, retrying");
                }
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep(BOOTSTRAP_RETRY_INTERVAL) => {}
            }
        }
    }

    async fn ensure_upload_queue(&self) -> anyhow::Result<(String, String)> {
        let queue_name = &self.pipeline.upload_queue_name;
        info!(queue = %queue_name, "Ensuring upload queue");

        let created = self
            .sqs
            .create_queue()
            .queue_name(queue_name)
            .attributes(
                QueueAttributeName::ReceiveMessageWaitTimeSeconds,
                self.long_poll.as_secs().min(20).to_string(),
            )
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                self.visibility_timeout.as_secs().to_string(),
            )
            .send()
            .await
            .context("creating upload queue")?;
        let queue_url = created
            .queue_url()
            .ok_or_else(|| anyhow!("create_queue returned no URL"))?
            .to_string();

        let attributes = self
            .sqs
            .get_queue_attributes()
            .queue_url(&queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .context("reading upload queue ARN")?;
        let queue_arn = attributes
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| anyhow!("queue {queue_name} has no ARN"))?;

        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "AllowS3Uploads",
                "Effect": "Allow",
                "Principal": { "Service": "s3.amazonaws.com" },
                "Action": "sqs:SendMessage",
                "Resource": queue_arn,
                "Condition": {
                    "ArnEquals": {
                        "aws:SourceArn": format!("arn:aws:s3:::{}", self.pipeline.upload_bucket)
                    }
                }
            }]
        });
        self.sqs
            .set_queue_attributes()
            .queue_url(&queue_url)
            .attributes(QueueAttributeName::Policy, policy.to_string())
            .send()
            .await
            .context("setting upload queue policy")?;

        Ok((queue_url, queue_arn))
    }

    async fn configure_upload_notifications(&self, queue_arn: &str) -> anyhow::Result<()> {
        info!(
            bucket = %self.pipeline.upload_bucket,
            queue_arn = %queue_arn,
            "Configuring upload bucket notifications"
        );

        let queue_configuration = QueueConfiguration::builder()
            .id("UploadEvents")
            .queue_arn(queue_arn)
            .events(Event::from("s3:ObjectCreated:*"))
            .build()
            .context("building queue notification configuration")?;

        self.store
            .client()
            .put_bucket_notification_configuration()
            .bucket(&self.pipeline.upload_bucket)
            .notification_configuration(
                NotificationConfiguration::builder()
                    .queue_configurations(queue_configuration)
                    .build(),
            )
            .send()
            .await
            .context("configuring upload bucket notifications")?;

        Ok(())
    }
}
