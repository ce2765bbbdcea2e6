/// Object store connection settings
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Custom endpoint for S3-compatible services (LocalStack, MinIO)
    pub endpoint_url: Option<String>,
    /// AWS region
    pub region: String,
    /// Whether to use path-style URLs (required by most local emulators)
    pub force_path_style: bool,
    /// Deadline for a single storage call
    pub request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: "us-east-1".to_string(),
            force_path_style: false,
            request_timeout: resilience::object_storage_config().timeout.duration,
        }
    }
}

impl StoreConfig {
    /// Load object store configuration from environment variables
    pub fn from_env() -> Self {
        let endpoint_url = std::env::var("AWS_ENDPOINT_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let force_path_style = std::env::var("S3_FORCE_PATH_STYLE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(endpoint_url.is_some());

        let request_timeout = std::env::var("S3_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Self::default().request_timeout);

        Self {
            endpoint_url,
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            force_path_style,
            request_timeout,
        }
    }
}
