//! Blob storage: the `BlobStore` seam and its S3-compatible implementation,
//! plus the path layout the pipeline stages agree on.

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Object storage operations the pipeline needs. Implemented by
/// [`S3BlobStore`] in production and by an in-memory fake in tests.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    async fn upload(&self, path: &str, data: &[u8], content_type: &str)
        -> Result<(), StorageError>;
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Move a blob via copy-then-delete so a crash between the two steps
    /// leaves the source intact. A failed delete is logged and left for a
    /// later sweep; it never fails the move.
    async fn move_blob(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let data = self.download(from).await?;
        self.upload(to, &data, "image/jpeg").await?;
        if let Err(e) = self.delete(from).await {
            tracing::warn!(from, to, error = %e, "blob delete after copy failed, leaving source");
        }
        Ok(())
    }
}

/// Client for S3-compatible object storage.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
}

impl S3BlobStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(path).await.map_err(StorageError::S3)?;
        Ok(response.to_vec())
    }

    async fn upload(
        &self,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(path, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.bucket.delete_object(path).await.map_err(StorageError::S3)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Standardized blob paths. The folder layout is part of the pipeline
/// contract: the uploader writes `incoming/`, preprocessing archives to
/// `original/` and produces `preprocessed/`, and terminal stages move the
/// working artifact to `processed/`, `failed/` or `manual-review/`.
pub struct BlobPaths;

impl BlobPaths {
    pub const INCOMING: &'static str = "incoming";
    pub const ORIGINAL: &'static str = "original";
    pub const PREPROCESSED: &'static str = "preprocessed";
    pub const PROCESSED: &'static str = "processed";
    pub const FAILED: &'static str = "failed";
    pub const MANUAL_REVIEW: &'static str = "manual-review";

    pub fn incoming(batch_id: &str, filename: &str) -> String {
        format!("{}/{batch_id}/{filename}", Self::INCOMING)
    }

    pub fn original(batch_id: &str, filename: &str) -> String {
        format!("{}/{batch_id}/{filename}", Self::ORIGINAL)
    }

    pub fn preprocessed(batch_id: &str, image_id: &str) -> String {
        format!("{}/{batch_id}/{image_id}.jpg", Self::PREPROCESSED)
    }

    /// Rotation variants live beside the normalized artifact; 0° is the
    /// normalized artifact itself.
    pub fn rotation(batch_id: &str, image_id: &str, angle: u16) -> String {
        format!("{}/{batch_id}/{image_id}_rot{angle}.jpg", Self::PREPROCESSED)
    }

    pub fn processed(batch_id: &str, image_id: &str) -> String {
        format!("{}/{batch_id}/{image_id}.jpg", Self::PROCESSED)
    }

    pub fn failed(batch_id: &str, image_id: &str) -> String {
        format!("{}/{batch_id}/{image_id}.jpg", Self::FAILED)
    }

    pub fn manual_review(batch_id: &str, image_id: &str) -> String {
        format!("{}/{batch_id}/{image_id}.jpg", Self::MANUAL_REVIEW)
    }

    /// First path component.
    pub fn folder(path: &str) -> &str {
        path.split('/').next().unwrap_or("")
    }

    /// Rewrite the folder component, keeping the rest of the path.
    pub fn change_folder(path: &str, new_folder: &str) -> Option<String> {
        let (_, rest) = path.split_once('/')?;
        Some(format!("{new_folder}/{rest}"))
    }
}
