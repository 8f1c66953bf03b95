//! Object storage for cached token artifacts
//!
//! [`ObjectStore`] is the seam the pipeline writes through. [`Storage`] is the
//! S3-compatible implementation used in deployments; [`memory::MemoryObjectStore`]
//! backs tests and local runs without a bucket.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use thiserror::Error;
use tokenmedia_common::checksum::CHECKSUM_METADATA_KEY;
use tracing::{debug, info, instrument};

pub mod artifacts;
pub mod config;
pub mod memory;

/// Every artifact is served uncached; freshness is driven by explicit purges.
pub const ARTIFACT_CACHE_CONTROL: &str = "no-cache, no-store";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object store request failed for {key}: {message}")]
    Request { key: String, message: String },

    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    fn request(key: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Request {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

/// Headers attached to an uploaded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: String,
    pub content_encoding: Option<String>,
    /// Hex SHA-256 of the body, stored as object metadata
    pub checksum: Option<String>,
}

impl PutOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            content_encoding: None,
            checksum: None,
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// What a `HEAD` of a stored object reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub key: String,
    pub size: i64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub checksum: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a complete body; the object becomes visible only once fully written.
    async fn put(&self, key: &str, body: Bytes, options: PutOptions) -> Result<(), StorageError>;

    /// Delete an object; deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn head(&self, key: &str) -> Result<Option<ObjectHead>, StorageError>;

    /// Public URL the object is served from
    fn public_url(&self, key: &str) -> String;
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
    public_host: String,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> anyhow::Result<Self> {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing storage");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "tokenmedia-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, "Storage client initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
            public_host: config.public_host,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Confirm the bucket is reachable
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for Storage {
    #[instrument(skip(self, body, options), fields(bucket = %self.bucket, size = body.len()))]
    async fn put(&self, key: &str, body: Bytes, options: PutOptions) -> Result<(), StorageError> {
        debug!(content_type = %options.content_type, "Uploading artifact");

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&options.content_type)
            .cache_control(ARTIFACT_CACHE_CONTROL)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body));

        if let Some(encoding) = &options.content_encoding {
            request = request.content_encoding(encoding);
        }

        if let Some(checksum) = &options.checksum {
            request = request.metadata(CHECKSUM_METADATA_KEY, checksum);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::request(key, aws_sdk_s3::error::DisplayErrorContext(e)))?;

        info!("Uploaded s3://{}/{}", self.bucket, key);

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::request(key, aws_sdk_s3::error::DisplayErrorContext(e)))?;

        debug!("Deleted s3://{}/{}", self.bucket, key);

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head(&self, key: &str) -> Result<Option<ObjectHead>, StorageError> {
        let response = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    return Ok(None);
                }
                return Err(StorageError::request(
                    key,
                    aws_sdk_s3::error::DisplayErrorContext(e),
                ));
            }
        };

        Ok(Some(ObjectHead {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0),
            content_type: response.content_type().map(str::to_string),
            content_encoding: response.content_encoding().map(str::to_string),
            checksum: response
                .metadata()
                .and_then(|m| m.get(CHECKSUM_METADATA_KEY))
                .cloned(),
        }))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.public_host, self.bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(public_host: &str) -> Storage {
        Storage {
            client: Client::from_conf(aws_sdk_s3::Config::builder().build()),
            bucket: "token-content".to_string(),
            public_host: public_host.to_string(),
        }
    }

    #[test]
    fn test_public_url() {
        let storage = storage("https://storage.googleapis.com");
        assert_eq!(
            storage.public_url("image-base-0xabc-0x1"),
            "https://storage.googleapis.com/token-content/image-base-0xabc-0x1"
        );
    }

    #[test]
    fn test_put_options_builder() {
        let options = PutOptions::new("application/octet-stream")
            .with_encoding("gzip")
            .with_checksum("abc");
        assert_eq!(options.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(options.checksum.as_deref(), Some("abc"));
    }
}
