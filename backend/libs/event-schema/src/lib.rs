use chrono::{DateTime, Utc};
/// Event schemas shared by the processor and the live-update service
///
/// Every stage of the pipeline speaks in these types:
/// - `UploadEvent`: an "object created" notification pulled from the upload queue
/// - `CompletionEvent`: published once a processed object is durably stored
/// - `LiveUpdatePayload`: the flat record pushed to browser clients
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod notification;
pub mod sns;

pub use notification::{parse_object_created, NotificationParseError, ObjectCreatedRecord};
pub use sns::{SnsHttpMessage, SnsParseError};

/// Current schema version for published events
pub const SCHEMA_VERSION: u32 = 1;

/// Object metadata key carrying the upload-session token
pub const SESSION_TOKEN_METADATA_KEY: &str = "session-token";

/// Opaque queue token identifying one delivery of one message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// "Object created" notification delivered by the upload queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    /// Key of the uploaded object, optionally prefixed with `<bucket>/`
    pub object_key: String,
    pub bucket: String,
    pub received_at: DateTime<Utc>,
    pub receipt_handle: ReceiptHandle,
}

impl UploadEvent {
    pub fn new(
        object_key: impl Into<String>,
        bucket: impl Into<String>,
        receipt_handle: ReceiptHandle,
    ) -> Self {
        Self {
            object_key: object_key.into(),
            bucket: bucket.into(),
            received_at: Utc::now(),
            receipt_handle,
        }
    }

    /// Key of the object inside its bucket
    ///
    /// `uploads/photo1.png` in bucket `uploads` resolves to `photo1.png`;
    /// a bucket-relative key is returned unchanged.
    pub fn storage_key(&self) -> &str {
        self.object_key
            .strip_prefix(self.bucket.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(&self.object_key)
    }

    /// Deterministic key of the processed result, qualified by the output bucket
    pub fn processed_key(&self, output_bucket: &str) -> String {
        format!("{}/{}", output_bucket, self.storage_key())
    }
}

/// Cost and latency recorded for one processed object
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub duration_ms: u64,
    pub cost_estimate: f64,
}

/// Published after the processed object has been written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub object_key: String,
    pub processed_key: String,
    /// Upload-session token echoed from the upload, used for routing live updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metrics_snapshot: MetricsSnapshot,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl CompletionEvent {
    pub fn new(
        object_key: impl Into<String>,
        processed_key: impl Into<String>,
        session_token: Option<String>,
        metrics_snapshot: MetricsSnapshot,
    ) -> Self {
        Self {
            object_key: object_key.into(),
            processed_key: processed_key.into(),
            session_token,
            timestamp: Utc::now(),
            metrics_snapshot,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Flat record delivered over the live-update channel
    pub fn live_payload(&self) -> LiveUpdatePayload {
        LiveUpdatePayload {
            object_key: self.object_key.clone(),
            processed_key: self.processed_key.clone(),
            timestamp: self.timestamp.to_rfc3339(),
        }
    }
}

/// Flat key-value record pushed to connected clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdatePayload {
    pub object_key: String,
    pub processed_key: String,
    pub timestamp: String,
}
