// dbbackup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::info;

use crate::config::S3StorageConfig;
use crate::errors::{AppError, Result};

/// Single-request object upload.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Human-readable location of `key`, for log lines.
    fn describe(&self, key: &str) -> String;
}

pub struct S3Uploader {
    client: s3::Client,
    bucket: String,
}

impl S3Uploader {
    /// Opens an S3 session with static credentials. A custom endpoint
    /// (MinIO, Spaces, ...) is addressed path-style.
    ///
    /// Each upload is exactly one PUT: SDK retries and timeouts are turned off.
    pub async fn connect(storage: &S3StorageConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(TimeoutConfig::disabled())
            .credentials_provider(s3::config::Credentials::new(
                &storage.access_key_id,
                &storage.secret_access_key,
                None,
                None,
                "Static",
            ));
        if !storage.uses_default_endpoint() {
            loader = loader.endpoint_url(&storage.endpoint_url);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(!storage.uses_default_endpoint())
            .build();

        S3Uploader {
            client: s3::Client::from_conf(s3_config),
            bucket: storage.bucket_name.clone(),
        }
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                AppError::Upload(format!(
                    "PUT {} failed: {}",
                    self.describe(key),
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

/// Reads `file_path` fully into memory and stores it under `key`.
pub async fn upload_file(uploader: &dyn Uploader, file_path: &Path, key: &str) -> Result<()> {
    info!(
        "☁️ Uploading {} to {}",
        file_path.display(),
        uploader.describe(key)
    );
    let body = tokio::fs::read(file_path)
        .await
        .map_err(|e| AppError::Upload(format!("Failed to read file {}: {}", file_path.display(), e)))?;
    let size = body.len();

    uploader.put_object(key, body).await?;

    info!(
        "✅ Successfully uploaded {} ({} bytes) to {}",
        file_path.display(),
        size,
        uploader.describe(key)
    );
    Ok(())
}
