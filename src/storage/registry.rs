//! Storage registry: the active backend for new writes plus any backend that
//! may still own objects written before the last reconfiguration.
//!
//! Built once at startup and shared read-only behind an `Arc`.

use super::{
    Platform, StorageBackend, StorageError, StorageResult, StoredPath,
    local::LocalStorage,
    s3::{S3Settings, S3Storage},
};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tracing::info;

/// Everything needed to build the registry.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub driver: Platform,
    pub local_root: PathBuf,
    pub s3: S3Settings,
}

pub struct StorageRegistry {
    active: Platform,
    backends: HashMap<Platform, Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    /// Assemble a registry from already-built backends.
    ///
    /// Fails when no backend is registered for `active`.
    pub fn new(
        active: Platform,
        backends: impl IntoIterator<Item = Arc<dyn StorageBackend>>,
    ) -> StorageResult<Self> {
        let backends: HashMap<_, _> = backends
            .into_iter()
            .map(|backend| (backend.platform(), backend))
            .collect();
        if !backends.contains_key(&active) {
            return Err(StorageError::BackendNotConfigured(active));
        }
        Ok(Self { active, backends })
    }

    /// Build the registry from configuration.
    ///
    /// The local backend is always available. S3 is added when it is the
    /// selected driver or when its credentials are fully configured, so that
    /// objects written while S3 was active stay readable after switching back
    /// to local.
    pub async fn from_settings(settings: &StorageSettings) -> StorageResult<Self> {
        let mut backends: Vec<Arc<dyn StorageBackend>> =
            vec![Arc::new(LocalStorage::new(&settings.local_root).await?)];

        if settings.driver == Platform::S3 || settings.s3.is_complete() {
            let s3 = S3Storage::new(&settings.s3)?;
            s3.verify_bucket().await;
            backends.push(Arc::new(s3));
        }

        let registry = Self::new(settings.driver, backends)?;
        info!(
            "storage registry ready, active backend `{}`, configured {:?}",
            registry.active,
            registry.platforms()
        );
        Ok(registry)
    }

    /// Platform used for new writes.
    pub fn active_platform(&self) -> Platform {
        self.active
    }

    /// Backend used for new writes.
    pub fn active(&self) -> Arc<dyn StorageBackend> {
        // `new` guarantees the active platform is registered
        self.backends[&self.active].clone()
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn StorageBackend>> {
        self.backends.get(&platform).cloned()
    }

    /// Decode a persisted locator and find the backend that owns it.
    pub fn by_stored_path(
        &self,
        locator: &str,
    ) -> StorageResult<(Arc<dyn StorageBackend>, StoredPath)> {
        let path = StoredPath::decode(locator)?;
        let backend = self
            .get(path.platform())
            .ok_or(StorageError::BackendNotConfigured(path.platform()))?;
        Ok((backend, path))
    }

    fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.backends.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }
}
