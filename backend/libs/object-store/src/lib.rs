/// Object storage port shared by the processor and the upload front-end
///
/// Provides one async trait over "bucket + key → bytes + metadata" with two
/// adapters: `S3ObjectStore` for S3-compatible services and
/// `InMemoryObjectStore` for tests and local runs.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

pub mod config;
pub mod memory;
pub mod s3;

pub use config::StoreConfig;
pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

/// Object body plus the attributes the pipeline cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl StoredObject {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Object store unavailable: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Async object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any existing object under the same key
    async fn put(&self, bucket: &str, key: &str, object: StoredObject) -> Result<(), StoreError>;

    /// Read an object
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError>;

    /// List keys in a bucket, optionally restricted to a prefix
    async fn list(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>, StoreError>;

    /// Create the bucket if it does not exist yet
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Time-limited GET URL a browser can fetch without credentials
    async fn presigned_get_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_object_builder() {
        let object = StoredObject::new(vec![1u8, 2, 3])
            .with_content_type("image/png")
            .with_metadata("session-token", "abc");

        assert_eq!(object.data.len(), 3);
        assert_eq!(object.content_type.as_deref(), Some("image/png"));
        assert_eq!(object.metadata_value("session-token"), Some("abc"));
        assert_eq!(object.metadata_value("missing"), None);
    }

    #[test]
    fn test_not_found_classification() {
        let err = StoreError::NotFound {
            bucket: "uploads".to_string(),
            key: "a.png".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Object not found: uploads/a.png");
        assert!(!StoreError::Transient("503".to_string()).is_not_found());
    }
}
