//! Resource rows: creation together with their first share link, the owner's
//! gallery listing, and deletion across storage and database.

use crate::{
    models::{
        resource::{GalleryItem, NewResource, Resource},
        share::ShareLink,
        user::User,
    },
    services::share_service::{ShareError, mint_share},
    storage::{StorageError, StorageRegistry},
};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GalleryPage {
    #[serde(rename = "data")]
    pub items: Vec<GalleryItem>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Clone)]
pub struct ResourceService {
    pub db: Arc<SqlitePool>,
    pub registry: Arc<StorageRegistry>,
}

impl ResourceService {
    pub fn new(db: Arc<SqlitePool>, registry: Arc<StorageRegistry>) -> Self {
        Self { db, registry }
    }

    /// Insert a resource and its password-less share link atomically.
    pub async fn create_with_share(
        &self,
        new: NewResource,
    ) -> ResourceResult<(Resource, ShareLink)> {
        let mut tx = self.db.begin().await?;

        let resource = sqlx::query_as::<_, Resource>(
            "INSERT INTO resources (filename, hash, content_type, stored_path, file_size, user_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id, filename, hash, content_type, stored_path, file_size, user_id, created_at",
        )
        .bind(&new.filename)
        .bind(&new.hash)
        .bind(&new.content_type)
        .bind(&new.stored_path)
        .bind(new.file_size)
        .bind(new.user_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        let share = mint_share(&mut *tx, resource.id, resource.user_id, None, None).await?;
        tx.commit().await?;

        Ok((resource, share))
    }

    pub async fn find_owned(&self, owner: &User, id: i64) -> ResourceResult<Resource> {
        sqlx::query_as::<_, Resource>(
            "SELECT id, filename, hash, content_type, stored_path, file_size, user_id, created_at
             FROM resources WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(owner.id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ResourceError::NotFound(id))
    }

    /// Newest-first page of the owner's uploads. `page` is 1-based.
    pub async fn list_by_user(
        &self,
        owner: &User,
        page: i64,
        page_size: i64,
    ) -> ResourceResult<GalleryPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resources WHERE user_id = ?")
            .bind(owner.id)
            .fetch_one(&*self.db)
            .await?;

        let items = sqlx::query_as::<_, GalleryItem>(
            "SELECT r.id, r.filename, r.content_type, r.file_size, r.created_at,
                    (SELECT s.code FROM shares s
                     WHERE s.resource_id = r.id AND (s.password IS NULL OR s.password = '')
                     ORDER BY s.id DESC LIMIT 1) AS share_code
             FROM resources r
             WHERE r.user_id = ?
             ORDER BY r.created_at DESC, r.id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(owner.id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(&*self.db)
        .await?;

        Ok(GalleryPage {
            items,
            total,
            page,
            page_size,
        })
    }

    /// Remove the stored object, then the share and resource rows.
    ///
    /// The object goes first so a failed storage delete leaves the rows in
    /// place and the request can be retried.
    pub async fn delete(&self, owner: &User, id: i64) -> ResourceResult<()> {
        let resource = self.find_owned(owner, id).await?;

        // identical uploads share an object key; the bytes go with the last row
        if self.count_by_stored_path(&resource.stored_path).await? > 1 {
            debug!("object {} still referenced, keeping it", resource.stored_path);
        } else {
            let (backend, path) = self.registry.by_stored_path(&resource.stored_path)?;
            backend.delete(&path).await?;
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM shares WHERE resource_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM resources WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(owner.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            // raced with another delete; dropping the tx rolls back
            return Err(ResourceError::NotFound(id));
        }
        tx.commit().await?;

        info!(
            user = %owner.username,
            resource_id = id,
            "deleted resource {}",
            resource.stored_path
        );
        Ok(())
    }

    /// Number of resource rows pointing at `stored_path`.
    pub async fn count_by_stored_path(&self, stored_path: &str) -> ResourceResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM resources WHERE stored_path = ?")
            .bind(stored_path)
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }
}
