/// Resilience patterns for calls to external infrastructure
///
/// This library provides the retry and timeout building blocks used by the
/// pipeline's storage and notification adapters:
/// - **Retry**: Bounded attempts with exponential backoff and jitter
/// - **Timeout**: Enforces time limits on external calls
/// - **Preset Configurations**: Pre-tuned settings for object storage,
///   notification publishing and queue polling
///
/// # Example: Publishing with Retry
///
/// ```rust,no_run
/// use resilience::{presets, with_retry_if};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::notification_publish_config();
///
///     let result = with_retry_if(
///         config.retry,
///         |e: &String| !e.contains("invalid"),
///         || async {
///             // Your publish call here
///             Ok::<_, String>(())
///         },
///     )
///     .await;
/// }
/// ```
///
/// # Example: Object Fetch with Timeout
///
/// ```rust,no_run
/// use resilience::{presets, timeout::with_timeout_result};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::object_storage_config();
///
///     let result = with_timeout_result(
///         config.timeout.duration,
///         async {
///             // Your storage call
///             Ok::<_, String>(())
///         }
///     ).await;
/// }
/// ```

pub mod presets;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use presets::{
    notification_publish_config, object_storage_config, queue_poll_config, ServiceConfig,
};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutConfig, TimeoutError};
