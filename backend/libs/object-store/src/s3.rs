/// S3-compatible object store adapter
use crate::{ObjectStore, StoreConfig, StoreError, StoredObject};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use resilience::timeout::{with_timeout_result, TimeoutError};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    region: String,
    request_timeout: Duration,
}

impl S3ObjectStore {
    pub fn new(client: Client, region: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client,
            region: region.into(),
            request_timeout,
        }
    }

    /// Build a client from an already loaded shared AWS configuration
    pub fn from_sdk_config(shared: &SdkConfig, config: &StoreConfig) -> Self {
        let s3_config = aws_sdk_s3::config::Builder::from(shared)
            .force_path_style(config.force_path_style)
            .build();

        Self::new(
            Client::from_conf(s3_config),
            config.region.clone(),
            config.request_timeout,
        )
    }

    /// Load AWS defaults (credentials chain, region, optional endpoint) and build a client
    pub async fn from_config(config: &StoreConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            info!(endpoint = %endpoint, "Using custom S3 endpoint");
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        Self::from_sdk_config(&shared, config)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn transient<E: Display>(err: TimeoutError<E>) -> StoreError {
    StoreError::Transient(err.to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, bucket: &str, key: &str, object: StoredObject) -> Result<(), StoreError> {
        let size = object.data.len();
        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(object.data))
            .set_content_type(object.content_type)
            .set_metadata((!object.metadata.is_empty()).then_some(object.metadata));

        with_timeout_result(self.request_timeout, request.send())
            .await
            .map_err(transient)?;

        debug!(bucket = %bucket, key = %key, size, "Stored object");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let request = self.client.get_object().bucket(bucket).key(key);

        let response = match with_timeout_result(self.request_timeout, request.send()).await {
            Ok(response) => response,
            Err(TimeoutError::Failed(e)) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(StoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
                return Err(StoreError::Transient(
                    service_error
                        .message()
                        .unwrap_or("get_object failed")
                        .to_string(),
                ));
            }
            Err(elapsed) => return Err(transient(elapsed)),
        };

        let content_type = response.content_type().map(str::to_string);
        let metadata = response.metadata().cloned().unwrap_or_default();
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?
            .into_bytes();

        Ok(StoredObject {
            data,
            content_type,
            metadata,
        })
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_prefix(prefix.map(str::to_string))
                .set_continuation_token(continuation_token.take());

            let response = with_timeout_result(self.request_timeout, request.send())
                .await
                .map_err(transient)?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn presigned_get_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StoreError> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning);

        let presigned = with_timeout_result(self.request_timeout, request)
            .await
            .map_err(transient)?;
        Ok(presigned.uri().to_string())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let head = self.client.head_bucket().bucket(bucket).send().await;
        if head.is_ok() {
            debug!(bucket = %bucket, "Bucket exists");
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %bucket, "Created bucket");
                Ok(())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_bucket_already_owned_by_you()
                    || service_error.is_bucket_already_exists()
                {
                    Ok(())
                } else {
                    Err(StoreError::Transient(format!(
                        "create bucket {} failed: {}",
                        bucket,
                        service_error.message().unwrap_or("unknown error")
                    )))
                }
            }
        }
    }
}
