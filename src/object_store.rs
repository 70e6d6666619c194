//! Object storage contract and the S3-backed implementation.

use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors that can occur writing to the object store
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("failed to write object {key}: {message}")]
    WriteFailed { key: String, message: String },
}

/// Canned access policy applied to a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectAcl {
    #[default]
    Private,
    PublicRead,
}

/// Options for a single object write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub acl: ObjectAcl,
}

/// Object store collaborator contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key`, overwriting any existing object.
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<(), ObjectStoreError>;
}

/// S3-backed object store.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body, options), fields(key = %key, size_bytes = body.len()))]
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<(), ObjectStoreError> {
        let size_bytes = body.len();

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .metadata("uploaded-at", Utc::now().to_rfc3339());

        if let Some(ref content_type) = options.content_type {
            request = request.content_type(content_type);
        }

        if options.acl == ObjectAcl::PublicRead {
            request = request.acl(ObjectCannedAcl::PublicRead);
        }

        request
            .send()
            .await
            .map_err(|e| ObjectStoreError::WriteFailed {
                key: key.to_string(),
                message: DisplayErrorContext(e).to_string(),
            })?;

        debug!(size_bytes, "Object stored");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryObjectStore;
    use super::*;

    #[test]
    fn test_put_options_default_to_private() {
        let options = PutOptions::default();
        assert_eq!(options.acl, ObjectAcl::Private);
        assert!(options.content_type.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_records_writes() {
        let store = MemoryObjectStore::new();
        let options = PutOptions {
            content_type: Some("image/jpeg".to_string()),
            acl: ObjectAcl::PublicRead,
        };

        store
            .put_object("images/cat/a.jpeg", vec![1, 2, 3], &options)
            .await
            .unwrap();

        let puts = store.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].key, "images/cat/a.jpeg");
        assert_eq!(puts[0].body, vec![1, 2, 3]);
        assert_eq!(puts[0].content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(puts[0].acl, ObjectAcl::PublicRead);
    }

    #[tokio::test]
    async fn test_memory_store_injected_failure() {
        let store = MemoryObjectStore::new();
        store.fail_keys_containing("/dog/");

        let err = store
            .put_object("images/dog/a.jpeg", vec![0], &PutOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ObjectStoreError::WriteFailed { ref key, .. } if key.contains("dog")));
        assert!(store.puts().is_empty());
    }
}
