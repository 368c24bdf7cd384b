//! S3-compatible object store backend (AWS S3, MinIO, Cloudflare R2).
//!
//! Reads are never proxied: `resolve_for_read` hands out a presigned GET URL.

use super::{
    DEFAULT_SIGNED_URL_TTL, ObjectBody, Platform, ReadLocation, StorageBackend, StorageError,
    StorageResult, StoredPath,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region},
    presigning::PresigningConfig,
    primitives::{ByteStream, Length},
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub region: String,
}

impl S3Settings {
    /// True when every field needed to build a client is present.
    pub fn is_complete(&self) -> bool {
        [
            &self.bucket,
            &self.access_key,
            &self.secret_key,
            &self.endpoint,
        ]
        .iter()
        .all(|v| !v.trim().is_empty())
    }
}

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Build a client. No network traffic happens here; see [`Self::verify_bucket`].
    pub fn new(settings: &S3Settings) -> StorageResult<Self> {
        if !settings.is_complete() {
            return Err(StorageError::Config(
                "s3 requires bucket, access key, secret key and endpoint".into(),
            ));
        }

        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "linkit",
        );
        let region = if settings.region.trim().is_empty() {
            "auto".to_string()
        } else {
            settings.region.clone()
        };

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&settings.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            // MinIO and R2 need path-style addressing
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket: settings.bucket.clone(),
        })
    }

    /// Best-effort connectivity check, logged but never fatal.
    pub async fn verify_bucket(&self) {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => info!("connected to S3 bucket {}", self.bucket),
            Err(err) => warn!(
                "could not verify bucket {}: {}. Will attempt operations anyway.",
                self.bucket, err
            ),
        }
    }

    /// Objects written before a bucket rename keep their own bucket name.
    fn bucket_for<'a>(&'a self, path: &'a StoredPath) -> &'a str {
        if path.bucket().is_empty() {
            &self.bucket
        } else {
            path.bucket()
        }
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn platform(&self) -> Platform {
        Platform::S3
    }

    async fn write(
        &self,
        object_key: &str,
        body: ObjectBody,
        size: Option<u64>,
        content_type: &str,
    ) -> StorageResult<StoredPath> {
        let stored = StoredPath::encode(Platform::S3, &self.bucket, object_key)?;

        // PutObject needs a content length up front; unknown lengths are
        // buffered in memory first.
        let (stream, length) = match (body, size) {
            (ObjectBody::Bytes(bytes), _) => {
                let len = bytes.len() as u64;
                (ByteStream::from(bytes), len)
            }
            (ObjectBody::File(path), Some(len)) => {
                let stream = ByteStream::read_from()
                    .path(&path)
                    .length(Length::Exact(len))
                    .build()
                    .await
                    .map_err(|e| StorageError::Remote(format!("open {}: {}", path.display(), e)))?;
                (stream, len)
            }
            (ObjectBody::File(path), None) => {
                let data = tokio::fs::read(&path).await?;
                let len = data.len() as u64;
                (ByteStream::from(data), len)
            }
        };

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(stored.key())
            .body(stream)
            .content_length(length as i64);
        if !content_type.is_empty() {
            request = request.content_type(content_type);
        }
        request.send().await.map_err(|e| {
            StorageError::Remote(format!("failed to put object {}: {}", stored.key(), e))
        })?;

        debug!("stored s3 object {} ({} bytes)", stored, length);
        Ok(stored)
    }

    async fn resolve_for_read(
        &self,
        path: &StoredPath,
        ttl: Duration,
    ) -> StorageResult<ReadLocation> {
        self.ensure_platform(path)?;
        let ttl = if ttl.is_zero() {
            DEFAULT_SIGNED_URL_TTL
        } else {
            ttl
        };
        let presign = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Remote(format!("invalid presign ttl: {e}")))?;

        let request = self
            .client
            .get_object()
            .bucket(self.bucket_for(path))
            .key(path.key())
            .presigned(presign)
            .await
            .map_err(|e| StorageError::Remote(format!("failed to presign {}: {}", path, e)))?;

        Ok(ReadLocation::SignedUrl(request.uri().to_string()))
    }

    async fn delete(&self, path: &StoredPath) -> StorageResult<()> {
        self.ensure_platform(path)?;
        // S3 reports success for keys that do not exist
        self.client
            .delete_object()
            .bucket(self.bucket_for(path))
            .key(path.key())
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("failed to delete {}: {}", path, e)))?;
        debug!("removed s3 object {}", path);
        Ok(())
    }
}
