/// Error types for the live-update service
///
/// `AppError` is what HTTP handlers return; it renders as a JSON body
/// `{error, message, status}`. `ConnectionError` stays inside the hub.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use object_store::StoreError;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures on the hub side of a live connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("session token is empty or too long")]
    InvalidSession,

    #[error("hub is shutting down")]
    ShuttingDown,

    #[error("connection {0} could not drain its buffer in time")]
    SlowConsumer(String),

    #[error("connection {0} was idle too long")]
    IdleTimeout(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    status: u16,
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::Storage(_) => "storage_error",
            AppError::Upstream(_) => "upstream_error",
            AppError::Unavailable(_) => "unavailable",
            AppError::Config(_) | AppError::Internal(_) => "server_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(ErrorBody {
            error: self.error_type(),
            message: self.to_string(),
            status: status.as_u16(),
        })
    }
}

impl From<ConnectionError> for AppError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::InvalidSession => AppError::BadRequest(err.to_string()),
            ConnectionError::ShuttingDown => AppError::Unavailable(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}
