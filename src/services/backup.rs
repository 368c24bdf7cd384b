//! Daily copy of the SQLite database file into object storage.
//!
//! Only runs when S3 is the active backend: one backup right after startup,
//! then one every local midnight until the shutdown token fires.

use crate::{
    db::resolve_db_path,
    storage::{ObjectBody, Platform, StorageBackend, StorageRegistry, StoredPath},
};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone, Timelike};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{fs, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_DB_NAME: &str = "app.db";

/// Start the backup loop if S3 is the active backend and the database lives
/// on disk. Returns the task handle when a loop was started.
pub fn spawn_daily_backup(
    registry: &StorageRegistry,
    database_url: &str,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if registry.active_platform() != Platform::S3 {
        return None;
    }
    let Some(backend) = registry.get(Platform::S3) else {
        warn!("s3 backend not initialised, skipping database backup");
        return None;
    };
    let Some(db_path) = resolve_db_path(database_url) else {
        warn!("database {} is not a file, skipping backup", database_url);
        return None;
    };
    let db_path = PathBuf::from(db_path);

    info!("starting daily database backup of {}", db_path.display());
    Some(tokio::spawn(run_backup_loop(backend, db_path, shutdown)))
}

async fn run_backup_loop(
    backend: Arc<dyn StorageBackend>,
    db_path: PathBuf,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if let Err(err) = backup_once(backend.as_ref(), &db_path, Local::now()).await {
            error!("database backup failed: {:#}", err);
        }

        let wait = until_next_midnight(Local::now());
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("database backup task stopped");
}

/// Upload the database file to `backup/<timestamp>_<name>`.
pub async fn backup_once<Tz: TimeZone>(
    backend: &dyn StorageBackend,
    db_path: &Path,
    now: DateTime<Tz>,
) -> Result<StoredPath>
where
    Tz::Offset: std::fmt::Display,
{
    let meta = fs::metadata(db_path)
        .await
        .with_context(|| format!("reading database file {}", db_path.display()))?;
    if meta.is_dir() {
        bail!("database path {} is a directory", db_path.display());
    }

    let base = db_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let key = backup_object_key(&now, &base);
    let stored = backend
        .write(
            &key,
            ObjectBody::File(db_path.to_path_buf()),
            Some(meta.len()),
            "application/octet-stream",
        )
        .await?;

    info!(
        "database backed up to {} ({:.2} KB)",
        stored,
        meta.len() as f64 / 1024.0
    );
    Ok(stored)
}

pub fn backup_object_key<Tz: TimeZone>(now: &DateTime<Tz>, base: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let name = match base.trim() {
        "" => DEFAULT_DB_NAME,
        name => name,
    };
    format!("backup/{}_{}", now.format("%Y_%m_%d_%H%M%S"), name)
}

/// Time left until the next local midnight.
pub fn until_next_midnight(now: DateTime<Local>) -> Duration {
    let next = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| {
            Local
                .from_local_datetime(&day.and_time(NaiveTime::MIN))
                .earliest()
        });
    match next {
        Some(next) => (next - now).to_std().unwrap_or(Duration::from_secs(60)),
        // midnight skipped by a DST jump; retry within the hour
        None => Duration::from_secs(60 * 60 - u64::from(now.minute()) * 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn object_key_format() {
        let now = Utc.with_ymd_and_hms(2025, 12, 21, 19, 56, 22).unwrap();
        assert_eq!(
            backup_object_key(&now, "app.db"),
            "backup/2025_12_21_195622_app.db"
        );
        assert_eq!(
            backup_object_key(&now, " "),
            "backup/2025_12_21_195622_app.db"
        );
    }

    #[test]
    fn next_midnight_is_within_a_day() {
        let wait = until_next_midnight(Local::now());
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(25 * 60 * 60));
    }

    #[tokio::test]
    async fn copies_database_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("linkit.db");
        std::fs::write(&db_path, b"SQLite format 3").unwrap();
        let storage = LocalStorage::new(dir.path().join("store")).await.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let stored = backup_once(&storage, &db_path, now).await.unwrap();
        assert_eq!(stored.key(), "backup/2025_01_02_030405_linkit.db");
        let copied = std::fs::read(
            dir.path()
                .join("store")
                .join("backup")
                .join("2025_01_02_030405_linkit.db"),
        )
        .unwrap();
        assert_eq!(copied, b"SQLite format 3");
    }

    #[tokio::test]
    async fn missing_database_is_an_error() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();
        assert!(
            backup_once(&storage, &dir.path().join("absent.db"), Utc::now())
                .await
                .is_err()
        );
        assert!(backup_once(&storage, dir.path(), Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn local_driver_starts_no_backup() {
        let dir = TempDir::new().unwrap();
        let local: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
        let registry = StorageRegistry::new(Platform::Local, [local]).unwrap();
        assert!(
            spawn_daily_backup(&registry, "sqlite://x.db", CancellationToken::new()).is_none()
        );
    }
}
