//! Shared fixtures: an in-process pipeline wired from the in-memory adapters

#![allow(dead_code)]

use idempotent_consumer::{LedgerConfig, ProcessingLedger};
use object_store::InMemoryObjectStore;
use processor_service::config::PublishConfig;
use processor_service::metrics::InMemoryMetricsSink;
use processor_service::queue::InMemoryQueue;
use processor_service::services::{PipelinePorts, PublishBridge, WorkerPool, WorkerSettings};
use processor_service::topic::InMemoryTopic;
use processor_service::transform::InvertTransform;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const UPLOAD_BUCKET: &str = "uploads";
pub const OUTPUT_BUCKET: &str = "processed";
pub const TOPIC: &str = "processed-updates";
pub const NAMESPACE: &str = "PhotoPipeline";

/// Route worker logs through the test writer; `RUST_LOG=debug` to see them
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_fn(8, 8, |x, y| image::Rgb([x as u8 * 30, y as u8 * 30, 200]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageOutputFormat::Png)
        .unwrap();
    buf
}

pub struct PipelineFixture {
    pub queue: Arc<InMemoryQueue>,
    pub store: Arc<InMemoryObjectStore>,
    pub metrics: Arc<InMemoryMetricsSink>,
    pub topic: Arc<InMemoryTopic>,
    pub ledger: Arc<ProcessingLedger>,
    shutdown_tx: watch::Sender<bool>,
    pool: Option<WorkerPool>,
}

impl PipelineFixture {
    pub fn new(visibility_timeout: Duration, max_attempts: u32) -> Self {
        init_test_tracing();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue: Arc::new(InMemoryQueue::new(visibility_timeout, UPLOAD_BUCKET)),
            store: Arc::new(InMemoryObjectStore::new()),
            metrics: Arc::new(InMemoryMetricsSink::new()),
            topic: Arc::new(InMemoryTopic::new()),
            ledger: Arc::new(ProcessingLedger::new(LedgerConfig {
                in_progress_timeout: visibility_timeout,
                max_attempts,
                ..LedgerConfig::default()
            })),
            shutdown_tx,
            pool: None,
        }
    }

    /// Start `concurrency` workers against the fixture's adapters
    pub fn start(&mut self, concurrency: usize) {
        let ports = PipelinePorts {
            queue: self.queue.clone(),
            store: self.store.clone(),
            transform: Arc::new(InvertTransform::default()),
            metrics: self.metrics.clone(),
        };
        let settings = WorkerSettings {
            output_bucket: OUTPUT_BUCKET.to_string(),
            metrics_namespace: NAMESPACE.to_string(),
            cost_per_image_usd: 0.0005,
            poll_max_messages: 5,
            poll_wait: Duration::from_millis(20),
        };
        let publish = PublishConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
        };
        let bridge = PublishBridge::new(self.topic.clone(), TOPIC, &publish);

        self.pool = Some(WorkerPool::spawn(
            concurrency,
            ports,
            self.ledger.clone(),
            settings,
            bridge,
            self.shutdown_tx.subscribe(),
        ));
    }

    /// Signal shutdown and wait for workers and the bridge to finish
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(pool) = self.pool.take() {
            pool.join().await;
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
