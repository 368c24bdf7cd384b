//! Shared application state handed to every handler.

use crate::{
    services::{
        resource_service::ResourceService, share_service::ShareService,
        upload_service::{UploadService, UploadSettings},
    },
    storage::StorageRegistry,
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub registry: Arc<StorageRegistry>,
    pub uploads: UploadService,
    pub shares: ShareService,
    pub resources: ResourceService,
    /// Name of the cookie carrying the session token.
    pub session_cookie: Arc<str>,
}

impl AppState {
    /// Wire the services around a pool and a storage registry.
    pub fn new(
        db: Arc<SqlitePool>,
        registry: Arc<StorageRegistry>,
        upload_settings: UploadSettings,
        session_cookie: &str,
    ) -> Self {
        let resources = ResourceService::new(db.clone(), registry.clone());
        let shares = ShareService::new(db.clone());
        let uploads = UploadService::new(upload_settings, registry.clone(), resources.clone());
        Self {
            db,
            registry,
            uploads,
            shares,
            resources,
            session_cookie: Arc::from(session_cookie),
        }
    }
}
