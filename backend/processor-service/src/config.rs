/// Configuration management for the processor service
///
/// Loads configuration from environment variables with sensible defaults.
use crate::error::{PipelineError, Result};
use idempotent_consumer::LedgerConfig;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub aws: AwsConfig,
    pub pipeline: PipelineConfig,
    pub worker: WorkerConfig,
    pub publish: PublishConfig,
    pub metrics_port: u16,
}

#[derive(Clone, Debug)]
pub struct AwsConfig {
    pub region: String,
    /// LocalStack or other emulator endpoint
    pub endpoint_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub upload_bucket: String,
    pub output_bucket: String,
    pub upload_queue_name: String,
    pub processed_topic_name: String,
    pub metrics_namespace: String,
    pub cost_per_image_usd: f64,
    pub output_quality: u8,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_max_messages: u32,
    pub poll_wait: Duration,
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub dedup_ttl: Duration,
    pub dedup_max_entries: usize,
}

#[derive(Clone, Debug)]
pub struct PublishConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

/// Largest batch SQS returns from one receive call
pub const MAX_POLL_MESSAGES: u32 = 10;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_bucket: "uploads".to_string(),
            output_bucket: "processed".to_string(),
            upload_queue_name: "upload-events".to_string(),
            processed_topic_name: "processed-updates".to_string(),
            metrics_namespace: "PhotoPipeline".to_string(),
            cost_per_image_usd: 0.0005,
            output_quality: 90,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_max_messages: 5,
            poll_wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(60),
            max_attempts: 3,
            dedup_ttl: Duration::from_secs(3600),
            dedup_max_entries: 10_000,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl WorkerConfig {
    /// Ledger settings for this worker group; in-flight claims expire with the visibility timeout
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            ttl: self.dedup_ttl,
            max_entries: self.dedup_max_entries,
            in_progress_timeout: self.visibility_timeout,
            max_attempts: self.max_attempts,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let pipeline_defaults = PipelineConfig::default();
        let worker_defaults = WorkerConfig::default();
        let publish_defaults = PublishConfig::default();

        let config = Config {
            aws: AwsConfig {
                region: env_string("AWS_REGION", "us-east-1"),
                endpoint_url: std::env::var("AWS_ENDPOINT_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
            },
            pipeline: PipelineConfig {
                upload_bucket: env_string("UPLOAD_BUCKET", &pipeline_defaults.upload_bucket),
                output_bucket: env_string("OUTPUT_BUCKET", &pipeline_defaults.output_bucket),
                upload_queue_name: env_string(
                    "UPLOAD_QUEUE_NAME",
                    &pipeline_defaults.upload_queue_name,
                ),
                processed_topic_name: env_string(
                    "PROCESSED_TOPIC_NAME",
                    &pipeline_defaults.processed_topic_name,
                ),
                metrics_namespace: env_string(
                    "METRICS_NAMESPACE",
                    &pipeline_defaults.metrics_namespace,
                ),
                cost_per_image_usd: env_or(
                    "COST_PER_IMAGE_USD",
                    pipeline_defaults.cost_per_image_usd,
                ),
                output_quality: env_or("OUTPUT_QUALITY", pipeline_defaults.output_quality),
            },
            worker: WorkerConfig {
                concurrency: env_or("WORKER_CONCURRENCY", worker_defaults.concurrency),
                poll_max_messages: env_or("POLL_MAX_MESSAGES", worker_defaults.poll_max_messages)
                    .clamp(1, MAX_POLL_MESSAGES),
                poll_wait: Duration::from_secs(env_or(
                    "POLL_WAIT_SECS",
                    worker_defaults.poll_wait.as_secs(),
                )),
                visibility_timeout: Duration::from_secs(env_or(
                    "VISIBILITY_TIMEOUT_SECS",
                    worker_defaults.visibility_timeout.as_secs(),
                )),
                max_attempts: env_or("MAX_ATTEMPTS", worker_defaults.max_attempts),
                dedup_ttl: Duration::from_secs(env_or(
                    "DEDUP_TTL_SECS",
                    worker_defaults.dedup_ttl.as_secs(),
                )),
                dedup_max_entries: env_or("DEDUP_MAX_ENTRIES", worker_defaults.dedup_max_entries),
            },
            publish: PublishConfig {
                max_attempts: env_or("PUBLISH_MAX_ATTEMPTS", publish_defaults.max_attempts),
                initial_backoff: Duration::from_millis(env_or(
                    "PUBLISH_INITIAL_BACKOFF_MS",
                    publish_defaults.initial_backoff.as_millis() as u64,
                )),
            },
            metrics_port: env_or("PROCESSOR_METRICS_PORT", 9102),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PipelineError::Config(msg.to_string()));

        if self.pipeline.upload_bucket == self.pipeline.output_bucket {
            return invalid("UPLOAD_BUCKET and OUTPUT_BUCKET must differ");
        }
        if self.worker.concurrency == 0 {
            return invalid("WORKER_CONCURRENCY must be at least 1");
        }
        if self.worker.max_attempts == 0 {
            return invalid("MAX_ATTEMPTS must be at least 1");
        }
        if self.worker.dedup_max_entries == 0 {
            return invalid("DEDUP_MAX_ENTRIES must be at least 1");
        }
        if self.worker.visibility_timeout.is_zero() {
            return invalid("VISIBILITY_TIMEOUT_SECS must be positive");
        }
        if self.publish.max_attempts == 0 {
            return invalid("PUBLISH_MAX_ATTEMPTS must be at least 1");
        }
        if self.pipeline.output_quality == 0 || self.pipeline.output_quality > 100 {
            return invalid("OUTPUT_QUALITY must be between 1 and 100");
        }
        let cost = self.pipeline.cost_per_image_usd;
        if !cost.is_finite() || cost < 0.0 {
            return invalid("COST_PER_IMAGE_USD must be non-negative");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aws: AwsConfig {
                region: "us-east-1".to_string(),
                endpoint_url: None,
            },
            pipeline: PipelineConfig::default(),
            worker: WorkerConfig::default(),
            publish: PublishConfig::default(),
            metrics_port: 9102,
        }
    }
}
