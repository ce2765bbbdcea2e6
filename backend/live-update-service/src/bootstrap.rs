//! Startup provisioning for the live-update side
//!
//! Runs after the HTTP server is listening, because SNS posts the
//! subscription confirmation to this service as soon as it subscribes.

use crate::config::Config;
use crate::sns::SnsGateway;
use anyhow::Context;
use object_store::ObjectStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub struct Bootstrap {
    store: Arc<dyn ObjectStore>,
    sns: SnsGateway,
    config: Config,
}

impl Bootstrap {
    pub fn new(store: Arc<dyn ObjectStore>, sns: SnsGateway, config: Config) -> Self {
        Self { store, sns, config }
    }

    /// Ensure both buckets, the processed topic and our HTTP subscription
    pub async fn ensure_all(&self) -> anyhow::Result<String> {
        for bucket in [&self.config.storage.upload_bucket, &self.config.storage.output_bucket] {
            self.store
                .ensure_bucket(bucket)
                .await
                .with_context(|| format!("ensuring bucket {bucket}"))?;
        }

        let topic_arn = self
            .sns
            .ensure_topic(&self.config.sns.processed_topic_name)
            .await
            .context("ensuring processed topic")?;
        self.sns
            .ensure_http_subscription(&topic_arn, &self.config.sns.http_endpoint)
            .await
            .context("ensuring topic subscription")?;

        Ok(topic_arn)
    }

    /// Retry until provisioned, then flip `ready`
    pub async fn run(self, ready: Arc<AtomicBool>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Provisioning live-update resources");
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            match self.ensure_all().await {
                Ok(topic_arn) => {
                    ready.store(true, Ordering::Release);
                    info!(topic_arn = %topic_arn, "Live-update resources ready");
                    return;
                }
                Err(e) => warn!(error = %format!("{e:#}"), "Provisioning failed, retrying"),
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(BOOTSTRAP_RETRY_INTERVAL) => {}
            }
        }
    }
}
