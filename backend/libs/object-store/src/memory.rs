/// In-process object store for tests and local runs
use crate::{ObjectStore, StoreError, StoredObject};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "memory://local";

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
    buckets: RwLock<HashSet<String>>,
    puts: AtomicU64,
    fail_next_gets: AtomicU32,
    fail_next_puts: AtomicU32,
    endpoint: Option<String>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presigned URLs are rooted at `endpoint`, as they would be for an emulator
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Total number of successful `put` calls (overwrites included)
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of objects currently stored in `bucket`
    pub fn object_count(&self, bucket: &str) -> usize {
        self.objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.read().contains(bucket)
    }

    /// Make the next `n` reads fail with a transient error
    pub fn fail_next_gets(&self, n: u32) {
        self.fail_next_gets.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail with a transient error
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_next_puts.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, object: StoredObject) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_next_puts) {
            return Err(StoreError::Transient("injected put failure".to_string()));
        }
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), object);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        if Self::take_failure(&self.fail_next_gets) {
            return Err(StoreError::Transient("injected get failure".to_string()));
        }
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.unwrap_or("");
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.buckets.write().insert(bucket.to_string());
        Ok(())
    }

    async fn presigned_get_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StoreError> {
        let endpoint = self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        Ok(format!(
            "{}/{bucket}/{key}?X-Amz-Expires={}",
            endpoint.trim_end_matches('/'),
            expires_in.as_secs()
        ))
    }
}
