//! Error types for the processing ledger

use crate::ProcessingStatus;
use thiserror::Error;

/// Result type for ledger operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while tracking processing state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    /// Object key validation failed (empty, too long)
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// No ledger entry exists for the key (never admitted, or evicted)
    #[error("No processing record for key: {0}")]
    UnknownKey(String),

    /// The requested state change is not allowed from the current status
    #[error("Invalid transition for {key}: {from:?} -> {to:?}")]
    InvalidTransition {
        key: String,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    /// Every slot is held by an unsettled record; nothing can be evicted
    #[error("Ledger at capacity ({0} entries, none settled)")]
    CapacityExhausted(usize),
}

impl IdempotencyError {
    /// Check if error is transient (the delivery should be retried later)
    pub fn is_transient(&self) -> bool {
        matches!(self, IdempotencyError::CapacityExhausted(_))
    }
}
