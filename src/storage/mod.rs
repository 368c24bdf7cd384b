//! Pluggable object storage.
//!
//! Every backend implements the same three operations (write, resolve for
//! read, delete) and speaks in [`StoredPath`] locators, so callers never need
//! to know which backend produced a resource.

pub mod local;
pub mod registry;
pub mod s3;
pub mod stored_path;

use async_trait::async_trait;
use bytes::Bytes;
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

pub use registry::StorageRegistry;
pub use stored_path::{Platform, StoredPath};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid stored path: {0}")]
    PathInvalid(String),
    #[error("unknown storage platform `{0}`")]
    UnknownPlatform(String),
    #[error("stored path belongs to `{found}`, not the `{expected}` backend")]
    PlatformMismatch { expected: Platform, found: Platform },
    #[error("no storage backend configured for platform `{0}`")]
    BackendNotConfigured(Platform),
    #[error("storage misconfigured: {0}")]
    Config(String),
    #[error("remote storage request failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Bytes handed to a backend for writing.
#[derive(Debug)]
pub enum ObjectBody {
    /// Fully buffered payload (single-shot uploads).
    Bytes(Bytes),
    /// A materialized file on local disk (merged uploads, backups).
    File(PathBuf),
}

/// Where a reader should go to fetch an object's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLocation {
    /// The backend can be streamed directly from this filesystem path.
    Local(PathBuf),
    /// The backend issued a time-limited URL.
    SignedUrl(String),
}

/// Signed GET URLs are valid this long unless the caller asks otherwise.
pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn platform(&self) -> Platform;

    /// Persist `body` under `object_key` and return its locator.
    ///
    /// `size` is the declared length when the caller knows it.
    async fn write(
        &self,
        object_key: &str,
        body: ObjectBody,
        size: Option<u64>,
        content_type: &str,
    ) -> StorageResult<StoredPath>;

    /// Resolve a locator for reading. A zero `ttl` selects the backend default.
    async fn resolve_for_read(&self, path: &StoredPath, ttl: Duration)
    -> StorageResult<ReadLocation>;

    /// Remove the object. Deleting an absent object succeeds.
    async fn delete(&self, path: &StoredPath) -> StorageResult<()>;

    /// Reject locators that belong to another platform.
    fn ensure_platform(&self, path: &StoredPath) -> StorageResult<()> {
        if path.platform() == self.platform() {
            Ok(())
        } else {
            Err(StorageError::PlatformMismatch {
                expected: self.platform(),
                found: path.platform(),
            })
        }
    }
}
