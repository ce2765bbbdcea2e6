/// Preset configurations for the pipeline's external dependencies
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Configuration bundle for one kind of dependency
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeout: TimeoutConfig,
    pub retry: RetryConfig,
}

/// S3/Object storage operations
///
/// - Timeout: 120s (large originals)
/// - Retry: 3 attempts (puts are idempotent, keys are deterministic)
pub fn object_storage_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(120),
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}

/// Completion notifications
///
/// - Timeout: 10s
/// - Retry: 3 attempts starting at 200ms
pub fn notification_publish_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(10),
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}

/// Queue receive/delete/visibility calls
///
/// - Timeout: long-poll wait plus headroom is applied by the caller
/// - Retry: 5 attempts with longer backoff (the queue is the only input)
pub fn queue_poll_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(30),
        },
        retry: RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(20),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_storage_config() {
        let config = object_storage_config();
        assert_eq!(config.timeout.duration, Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_notification_publish_config() {
        let config = notification_publish_config();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(200));
    }

    #[test]
    fn test_queue_poll_config() {
        let config = queue_poll_config();
        assert!(config.retry.max_attempts > notification_publish_config().retry.max_attempts);
    }
}
