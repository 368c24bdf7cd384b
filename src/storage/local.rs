//! Local filesystem backend.
//!
//! Objects live at `root/<key>`. Writes land in a temp file next to the
//! target and are renamed into place once flushed, so readers never observe
//! a half-written object.

use super::{
    ObjectBody, Platform, ReadLocation, StorageBackend, StorageError, StorageResult, StoredPath,
};
use async_trait::async_trait;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Open (and create if needed) a local storage root.
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(key.split('/'));
        path
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn platform(&self) -> Platform {
        Platform::Local
    }

    async fn write(
        &self,
        object_key: &str,
        body: ObjectBody,
        _size: Option<u64>,
        _content_type: &str,
    ) -> StorageResult<StoredPath> {
        let stored = StoredPath::encode(Platform::Local, "", object_key)?;
        let target = self.object_path(stored.key());
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = write_body(&tmp_path, body).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &target).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        debug!("stored local object {}", target.display());
        Ok(stored)
    }

    async fn resolve_for_read(
        &self,
        path: &StoredPath,
        _ttl: Duration,
    ) -> StorageResult<ReadLocation> {
        self.ensure_platform(path)?;
        Ok(ReadLocation::Local(self.object_path(path.key())))
    }

    async fn delete(&self, path: &StoredPath) -> StorageResult<()> {
        self.ensure_platform(path)?;
        let target = self.object_path(path.key());
        match fs::remove_file(&target).await {
            Ok(_) => debug!("removed local object {}", target.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("local object {} already missing", target.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = target.parent() {
            self.prune_empty_dirs(parent, &self.root).await;
        }
        Ok(())
    }
}

async fn write_body(tmp_path: &Path, body: ObjectBody) -> io::Result<()> {
    match body {
        ObjectBody::Bytes(bytes) => {
            let mut file = File::create(tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        ObjectBody::File(source) => {
            fs::copy(&source, tmp_path).await?;
            File::open(tmp_path).await?.sync_all().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_resolve_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let stored = storage
            .write(
                "2025-01/abc-hello.txt",
                ObjectBody::Bytes(Bytes::from_static(b"hello")),
                Some(5),
                "text/plain",
            )
            .await
            .unwrap();
        assert_eq!(stored.to_string(), "local@/2025-01/abc-hello.txt");

        let ReadLocation::Local(path) = storage
            .resolve_for_read(&stored, Duration::ZERO)
            .await
            .unwrap()
        else {
            panic!("local storage must resolve to a filesystem path");
        };
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        storage.delete(&stored).await.unwrap();
        assert!(!path.exists());
        // the now-empty month directory is pruned, the root is kept
        assert!(!dir.path().join("2025-01").exists());
        assert!(dir.path().exists());

        // second delete of the same object is not an error
        storage.delete(&stored).await.unwrap();
    }

    #[tokio::test]
    async fn write_copies_from_file() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().join("objects")).await.unwrap();
        let source = dir.path().join("merged.bin");
        std::fs::write(&source, b"merged bytes").unwrap();

        let stored = storage
            .write("a/b.bin", ObjectBody::File(source.clone()), None, "")
            .await
            .unwrap();

        let on_disk = dir.path().join("objects").join("a").join("b.bin");
        assert_eq!(std::fs::read(on_disk).unwrap(), b"merged bytes");
        assert_eq!(stored.key(), "a/b.bin");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn rejects_traversal_and_foreign_paths() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let err = storage
            .write("../escape.txt", ObjectBody::Bytes(Bytes::new()), Some(0), "")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PathInvalid(_)));

        let remote = StoredPath::decode("s3:bucket@/a.txt").unwrap();
        assert!(matches!(
            storage.delete(&remote).await,
            Err(StorageError::PlatformMismatch { .. })
        ));
        assert!(matches!(
            storage.resolve_for_read(&remote, Duration::ZERO).await,
            Err(StorageError::PlatformMismatch { .. })
        ));
    }
}
