//! Fixtures shared by unit tests.

use crate::db;
use chrono::Utc;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::Arc;

/// Single-connection in-memory database with the schema applied.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    Arc::new(pool)
}

/// Insert a plain resource row and return its id.
pub async fn insert_resource(db: &SqlitePool, user_id: i64, stored_path: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO resources (filename, hash, content_type, stored_path, file_size, user_id, created_at)
         VALUES ('a.txt', 'd41d8cd98f00b204e9800998ecf8427e', 'text/plain', ?, 5, ?, ?)
         RETURNING id",
    )
    .bind(stored_path)
    .bind(user_id)
    .bind(Utc::now())
    .fetch_one(db)
    .await
    .unwrap()
}

/// Give a user a session token.
pub async fn login(db: &SqlitePool, user_id: i64, token: &str) {
    sqlx::query("UPDATE users SET token = ? WHERE id = ?")
        .bind(token)
        .bind(user_id)
        .execute(db)
        .await
        .unwrap();
}

pub const OWNER_ID: i64 = 1;
pub const OWNER_TOKEN: &str = "owner-token";
pub const SESSION_COOKIE: &str = "linkit_session";

/// A full application over a temp directory and an in-memory database, with
/// the admin user signed in under [`OWNER_TOKEN`].
pub struct TestApp {
    pub dir: tempfile::TempDir,
    pub state: crate::state::AppState,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_guest_policy(None).await
    }

    pub async fn with_guest_policy(
        guest: Option<crate::services::upload_service::GuestPolicy>,
    ) -> Self {
        use crate::{
            services::upload_service::UploadSettings,
            state::AppState,
            storage::{Platform, StorageBackend, StorageRegistry, local::LocalStorage},
        };

        let dir = tempfile::TempDir::new().unwrap();
        let db = memory_pool().await;
        login(&db, OWNER_ID, OWNER_TOKEN).await;

        let local: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(dir.path().join("objects")).await.unwrap());
        let registry = Arc::new(StorageRegistry::new(Platform::Local, [local]).unwrap());
        let settings = UploadSettings {
            chunk_dir: dir.path().join("chunks"),
            merge_dir: dir.path().join("merge"),
            chunk_threshold: 8,
            max_file_size: 1024 * 1024,
            clean_limit: 2 * 1024 * 1024 * 1024,
            clean_expire: std::time::Duration::from_secs(30 * 60),
            guest,
        };
        let state = AppState::new(db, registry, settings, SESSION_COOKIE);
        Self { dir, state }
    }

    pub fn router(&self) -> axum::Router {
        crate::routes::routes::routes(self.state.uploads.settings().chunk_threshold)
            .with_state(self.state.clone())
    }

    pub fn owner_cookie(&self) -> String {
        format!("{}={}", SESSION_COOKIE, OWNER_TOKEN)
    }

    /// Store `data` on the local backend, owned by the signed-in user, and
    /// share it.
    pub async fn share_local_file(
        &self,
        filename: &str,
        data: &'static [u8],
        password: Option<&str>,
    ) -> String {
        use crate::storage::ObjectBody;

        let stored = self
            .state
            .registry
            .active()
            .write(
                &format!("2025-01/test-{}", filename),
                ObjectBody::Bytes(bytes::Bytes::from_static(data)),
                Some(data.len() as u64),
                "",
            )
            .await
            .unwrap();
        self.insert_share(filename, &stored.to_string(), password)
            .await
    }

    /// Insert a resource pointing at `stored_path` and share it.
    pub async fn share_stored_path(&self, stored_path: &str, password: Option<&str>) -> String {
        let filename = stored_path.rsplit('/').next().unwrap_or(stored_path);
        self.insert_share(filename, stored_path, password).await
    }

    async fn insert_share(&self, filename: &str, stored_path: &str, password: Option<&str>) -> String {
        let resource_id: i64 = sqlx::query_scalar(
            "INSERT INTO resources (filename, hash, content_type, stored_path, file_size, user_id, created_at)
             VALUES (?, '', '', ?, 0, ?, ?)
             RETURNING id",
        )
        .bind(filename)
        .bind(stored_path)
        .bind(OWNER_ID)
        .bind(Utc::now())
        .fetch_one(&*self.state.db)
        .await
        .unwrap();

        let mut conn = self.state.db.acquire().await.unwrap();
        crate::services::share_service::mint_share(&mut conn, resource_id, OWNER_ID, password, None)
            .await
            .unwrap()
            .code
    }

    pub async fn view_count(&self, code: &str) -> i64 {
        sqlx::query_scalar("SELECT view_count FROM shares WHERE code = ?")
            .bind(code)
            .fetch_one(&*self.state.db)
            .await
            .unwrap()
    }

    pub async fn expire_share(&self, code: &str) {
        sqlx::query("UPDATE shares SET expire_time = ? WHERE code = ?")
            .bind(Utc::now() - chrono::Duration::minutes(5))
            .bind(code)
            .execute(&*self.state.db)
            .await
            .unwrap();
    }

    /// Delete every stored object behind the application's back.
    pub fn remove_objects(&self) {
        std::fs::remove_dir_all(self.dir.path().join("objects")).unwrap();
    }
}
