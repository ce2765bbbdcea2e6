/// Configuration for the live-update service
///
/// Loaded from environment variables; invalid numbers fall back to defaults.
use crate::error::{AppError, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub aws: AwsConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub sns: SnsConfig,
    pub hub: HubConfig,
}

#[derive(Clone, Debug)]
pub struct AwsConfig {
    pub region: String,
    pub endpoint_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub upload_bucket: String,
    pub output_bucket: String,
    /// Browser-reachable origin substituted for the internal AWS endpoint in presigned URLs
    pub public_s3_endpoint: String,
}

#[derive(Clone, Debug)]
pub struct SnsConfig {
    pub processed_topic_name: String,
    /// Endpoint SNS delivers completion notifications to
    pub http_endpoint: String,
}

/// Fan-out hub tuning
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Number of independently locked index shards
    pub shards: usize,
    /// Per-connection buffer size at which the oldest event is dropped
    pub high_water_mark: usize,
    /// How long an overflowing buffer may stay undrained before disconnect
    pub drain_timeout: Duration,
    /// Connections without traffic for this long start draining
    pub idle_timeout: Duration,
    /// Time a draining connection gets to flush before it is closed
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    /// SSE comment frames keep proxies from cutting idle streams
    pub keepalive_interval: Duration,
    /// Inbound completion events buffered ahead of each shard dispatcher
    pub dispatch_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            high_water_mark: 64,
            drain_timeout: Duration::from_millis(5000),
            idle_timeout: Duration::from_secs(300),
            grace_period: Duration::from_millis(2000),
            sweep_interval: Duration::from_millis(1000),
            keepalive_interval: Duration::from_secs(15),
            dispatch_buffer: 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aws: AwsConfig {
                region: "us-east-1".to_string(),
                endpoint_url: None,
            },
            http: HttpConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
                max_upload_bytes: 25 * 1024 * 1024,
            },
            storage: StorageConfig {
                upload_bucket: "uploads".to_string(),
                output_bucket: "processed".to_string(),
                public_s3_endpoint: "http://localhost:4566".to_string(),
            },
            sns: SnsConfig {
                processed_topic_name: "processed-updates".to_string(),
                http_endpoint: "http://webapp:5000/sns/processed".to_string(),
            },
            hub: HubConfig::default(),
        }
    }
}

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

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        let hub = &defaults.hub;

        let config = Config {
            aws: AwsConfig {
                region: env_string("AWS_REGION", &defaults.aws.region),
                endpoint_url: std::env::var("AWS_ENDPOINT_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
            },
            http: HttpConfig {
                host: env_string("HTTP_HOST", &defaults.http.host),
                port: env_or("HTTP_PORT", defaults.http.port),
                max_upload_bytes: env_or("MAX_UPLOAD_BYTES", defaults.http.max_upload_bytes),
            },
            storage: StorageConfig {
                upload_bucket: env_string("UPLOAD_BUCKET", &defaults.storage.upload_bucket),
                output_bucket: env_string("OUTPUT_BUCKET", &defaults.storage.output_bucket),
                public_s3_endpoint: env_string(
                    "PUBLIC_S3_ENDPOINT",
                    &defaults.storage.public_s3_endpoint,
                ),
            },
            sns: SnsConfig {
                processed_topic_name: env_string(
                    "PROCESSED_TOPIC_NAME",
                    &defaults.sns.processed_topic_name,
                ),
                http_endpoint: env_string("SNS_HTTP_ENDPOINT", &defaults.sns.http_endpoint),
            },
            hub: HubConfig {
                shards: env_or("HUB_SHARDS", hub.shards),
                high_water_mark: env_or("HUB_HIGH_WATER_MARK", hub.high_water_mark),
                drain_timeout: env_millis("HUB_DRAIN_TIMEOUT_MS", hub.drain_timeout),
                idle_timeout: Duration::from_secs(env_or(
                    "HUB_IDLE_TIMEOUT_SECS",
                    hub.idle_timeout.as_secs(),
                )),
                grace_period: env_millis("HUB_GRACE_PERIOD_MS", hub.grace_period),
                sweep_interval: env_millis("HUB_SWEEP_INTERVAL_MS", hub.sweep_interval),
                keepalive_interval: Duration::from_secs(env_or(
                    "HUB_KEEPALIVE_SECS",
                    hub.keepalive_interval.as_secs(),
                )),
                dispatch_buffer: env_or("HUB_DISPATCH_BUFFER", hub.dispatch_buffer),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Rewrite a presigned URL minted against the internal endpoint so browsers can reach it
    pub fn public_url(&self, url: String) -> String {
        match self.aws.endpoint_url.as_deref() {
            Some(internal) if url.starts_with(internal) => format!(
                "{}{}",
                self.storage.public_s3_endpoint,
                &url[internal.len()..]
            ),
            _ => url,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(AppError::Config(msg.to_string()));

        if self.storage.upload_bucket == self.storage.output_bucket {
            return invalid("UPLOAD_BUCKET and OUTPUT_BUCKET must differ");
        }
        if self.http.max_upload_bytes == 0 {
            return invalid("MAX_UPLOAD_BYTES must be positive");
        }
        self.hub.validate()
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(AppError::Config(msg.to_string()));

        if self.shards == 0 {
            return invalid("HUB_SHARDS must be at least 1");
        }
        if self.high_water_mark == 0 {
            return invalid("HUB_HIGH_WATER_MARK must be at least 1");
        }
        if self.dispatch_buffer == 0 {
            return invalid("HUB_DISPATCH_BUFFER must be at least 1");
        }
        if self.sweep_interval.is_zero() || self.keepalive_interval.is_zero() {
            return invalid("hub intervals must be positive");
        }
        Ok(())
    }
}
