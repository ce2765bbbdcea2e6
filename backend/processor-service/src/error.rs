/// Error types for the processor service
///
/// Each port has its own error enum; `PipelineError` is what the worker sees
/// and classifies into "requeue" or "count against the attempt budget".
use idempotent_consumer::IdempotencyError;
use object_store::StoreError;
use thiserror::Error;

/// Result type for processor operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown or expired receipt handle: {0}")]
    UnknownReceipt(String),
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Transform task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("Notification backend unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid notification payload: {0}")]
    InvalidPayload(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Unreachable(_))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Ledger(#[from] IdempotencyError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Transient failures are expected to clear on redelivery; the rest are
    /// permanent and only the attempt budget stands between them and a drop.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Store(StoreError::Transient(_)) => true,
            PipelineError::Store(StoreError::NotFound { .. }) => false,
            PipelineError::Queue(_) => true,
            PipelineError::Transform(_) => false,
            PipelineError::Publish(e) => e.is_retryable(),
            PipelineError::Ledger(e) => e.is_transient(),
            PipelineError::Config(_) => false,
        }
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Store(StoreError::Transient(_)) => "transient_store",
            PipelineError::Store(StoreError::NotFound { .. }) => "object_not_found",
            PipelineError::Queue(_) => "queue",
            PipelineError::Transform(_) => "permanent_transform",
            PipelineError::Publish(_) => "publish",
            PipelineError::Ledger(_) => "ledger",
            PipelineError::Config(_) => "config",
        }
    }
}
