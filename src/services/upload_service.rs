//! Upload coordinator.
//!
//! Small files are hashed and written in one shot. Large files arrive as
//! numbered chunks under `chunk_dir/<uploadId>/<index>`; once every index is
//! on disk the chunks are concatenated into `merge_dir`, hashed, handed to the
//! active storage backend, and recorded together with a fresh share link.
//!
//! Each upload id has an async mutex in an in-memory session table. Every
//! chunk request for that id holds it from the duplicate check through merge
//! and cleanup, so exactly one request performs the merge.

use crate::{
    models::user::User,
    models::resource::NewResource,
    services::resource_service::{ResourceError, ResourceService},
    storage::{
        ObjectBody, StorageBackend, StorageError, StorageRegistry, StoredPath,
        stored_path::{build_object_key, guess_mime},
    },
};
use bytes::Bytes;
use chrono::{Local, Utc};
use md5::Context;
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MERGE_BUFFER_SIZE: usize = 64 * 1024;
/// Per-upload file recording the declared chunk count.
const TOTAL_MARKER: &str = ".total";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload id")]
    InvalidUploadId,
    #[error("missing file name")]
    InvalidFilename,
    #[error("invalid chunk parameters")]
    ChunkParamsInvalid,
    #[error("file size exceeds limit")]
    FileTooLarge,
    #[error("guest upload is not allowed")]
    GuestForbidden,
    #[error("please log in to upload")]
    LoginRequired,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// What anonymous callers may upload.
#[derive(Debug, Clone)]
pub struct GuestPolicy {
    max_bytes: u64,
    extensions: HashSet<String>,
}

impl GuestPolicy {
    /// `None` means guests may not upload at all: disabled, a zero size cap,
    /// or an empty whitelist.
    pub fn new(enabled: bool, max_mb: u64, whitelist: &str) -> Option<Self> {
        if !enabled || max_mb == 0 {
            return None;
        }
        let extensions: HashSet<String> = whitelist
            .split([',', ';', '|', ' ', '\n', '\t', '\r'])
            .map(normalize_ext)
            .filter(|ext| !ext.is_empty())
            .collect();
        if extensions.is_empty() {
            return None;
        }
        Some(Self {
            max_bytes: max_mb * 1024 * 1024,
            extensions,
        })
    }

    pub fn check(&self, filename: &str, size: u64) -> UploadResult<()> {
        let ext = filename
            .rfind('.')
            .map(|idx| normalize_ext(&filename[idx..]))
            .unwrap_or_default();
        if ext.is_empty() {
            return Err(UploadError::LoginRequired);
        }
        if !self.extensions.contains("*") && !self.extensions.contains(&ext) {
            return Err(UploadError::LoginRequired);
        }
        if size > self.max_bytes {
            return Err(UploadError::FileTooLarge);
        }
        Ok(())
    }
}

fn normalize_ext(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_lowercase()
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub chunk_dir: PathBuf,
    pub merge_dir: PathBuf,
    /// Declared sizes above this must be chunked.
    pub chunk_threshold: u64,
    pub max_file_size: u64,
    /// The janitor only runs when the chunk directory is larger than this.
    pub clean_limit: u64,
    /// Chunk files older than this are eligible for removal by the janitor.
    pub clean_expire: Duration,
    pub guest: Option<GuestPolicy>,
}

/// One upload request after multipart decoding.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub upload_id: Option<String>,
    /// Base name of the file as the client wants it recorded.
    pub filename: String,
    /// Size of the whole file. Falls back to the body length.
    pub file_size: Option<u64>,
    pub chunk_index: Option<i64>,
    pub total_chunks: Option<i64>,
    pub chunk_size: Option<i64>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub merged: bool,
    pub upload_id: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<i64>,
}

#[derive(Debug, Default)]
struct ChunkSession {
    total: Option<i64>,
    received: BTreeSet<i64>,
    loaded: bool,
    merged: bool,
}

type SessionTable = HashMap<String, Arc<AsyncMutex<ChunkSession>>>;

#[derive(Clone)]
pub struct UploadService {
    settings: Arc<UploadSettings>,
    registry: Arc<StorageRegistry>,
    resources: ResourceService,
    sessions: Arc<Mutex<SessionTable>>,
}

impl UploadService {
    pub fn new(
        settings: UploadSettings,
        registry: Arc<StorageRegistry>,
        resources: ResourceService,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            registry,
            resources,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Accept a single-shot upload or one chunk of a chunked upload.
    pub async fn handle(&self, user: &User, req: UploadRequest) -> UploadResult<UploadOutcome> {
        fs::create_dir_all(&self.settings.chunk_dir).await?;
        fs::create_dir_all(&self.settings.merge_dir).await?;
        self.sweep_chunks().await;

        let filename = req.filename.trim().to_string();
        if filename.is_empty() {
            return Err(UploadError::InvalidFilename);
        }
        let upload_id = match req.upload_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                validate_upload_id(id)?;
                id.to_string()
            }
            _ => format!(
                "{}-{}",
                Utc::now().timestamp_millis(),
                Uuid::new_v4().simple()
            ),
        };

        // the declared size picks the path; the body must fit either way
        let file_size = req.file_size.unwrap_or(req.data.len() as u64);
        self.check_size(user, &filename, file_size)?;
        self.check_size(user, &filename, req.data.len() as u64)?;

        let require_chunk = file_size > self.settings.chunk_threshold;
        debug!(
            user = %user.username,
            file = %filename,
            size = file_size,
            chunked = require_chunk,
            "upload request"
        );

        if !require_chunk && req.total_chunks.is_none_or(|total| total <= 1) {
            return self.store_single(user, upload_id, filename, req.data).await;
        }
        self.store_chunk(user, upload_id, filename, req).await
    }

    /// Indices of the chunks already on disk for `upload_id`, ascending.
    pub async fn uploaded_chunks(&self, upload_id: &str) -> UploadResult<Vec<i64>> {
        validate_upload_id(upload_id)?;
        self.sweep_chunks().await;
        Ok(chunk_indices_on_disk(&self.settings.chunk_dir.join(upload_id))
            .await?
            .into_iter()
            .collect())
    }

    /// Guest policy and the global size cap, applied to `size` bytes.
    fn check_size(&self, user: &User, filename: &str, size: u64) -> UploadResult<()> {
        if user.is_guest() {
            match &self.settings.guest {
                Some(policy) => policy.check(filename, size)?,
                None => return Err(UploadError::GuestForbidden),
            }
        }
        if size > self.settings.max_file_size {
            return Err(UploadError::FileTooLarge);
        }
        Ok(())
    }

    async fn store_single(
        &self,
        user: &User,
        upload_id: String,
        filename: String,
        data: Bytes,
    ) -> UploadResult<UploadOutcome> {
        let hash = format!("{:x}", md5::compute(&data));
        let size = data.len() as u64;
        let (resource_id, share_code) = self
            .persist(user, &filename, &hash, size, ObjectBody::Bytes(data))
            .await?;

        Ok(UploadOutcome {
            merged: true,
            upload_id,
            filename,
            size: Some(size as i64),
            share_code: Some(share_code),
            resource_id: Some(resource_id),
            ..Default::default()
        })
    }

    async fn store_chunk(
        &self,
        user: &User,
        upload_id: String,
        filename: String,
        req: UploadRequest,
    ) -> UploadResult<UploadOutcome> {
        let (index, total) = match (req.chunk_index, req.total_chunks) {
            (Some(index), Some(total)) if index >= 0 && total > 0 && index < total => {
                (index, total)
            }
            _ => return Err(UploadError::ChunkParamsInvalid),
        };

        let pending = UploadOutcome {
            merged: false,
            upload_id: upload_id.clone(),
            filename,
            chunk_index: Some(index),
            total_chunks: Some(total),
            chunk_size: req.chunk_size,
            ..Default::default()
        };

        let session = self.session(&upload_id);
        let result = {
            let mut guard = session.lock().await;
            let outcome = self
                .store_chunk_locked(&mut guard, user, index, total, pending, &req.data)
                .await;
            outcome
        };
        drop(session);
        self.release_idle_session(&upload_id);
        result
    }

    /// Body of [`Self::store_chunk`], run while holding the upload's lock.
    async fn store_chunk_locked(
        &self,
        session: &mut ChunkSession,
        user: &User,
        index: i64,
        total: i64,
        pending: UploadOutcome,
        data: &[u8],
    ) -> UploadResult<UploadOutcome> {
        if session.merged {
            return Ok(UploadOutcome {
                merged: true,
                skipped: true,
                ..pending
            });
        }

        let upload_id = pending.upload_id.clone();
        let folder = self.settings.chunk_dir.join(&upload_id);
        fs::create_dir_all(&folder).await?;
        if !session.loaded {
            session.received = chunk_indices_on_disk(&folder).await?;
            session.total = read_total(&folder).await;
            session.loaded = true;
        }
        match session.total {
            Some(known) if known != total => return Err(UploadError::ChunkParamsInvalid),
            Some(_) => {}
            None => {
                write_total(&folder, total).await?;
                session.total = Some(total);
            }
        }

        let chunk_path = folder.join(index.to_string());
        let duplicate = fs::try_exists(&chunk_path).await?;
        if duplicate {
            debug!("chunk {} of {} already present", index, upload_id);
        } else {
            write_chunk(&folder, &chunk_path, data).await?;
        }
        session.received.insert(index);
        let pending = UploadOutcome {
            skipped: duplicate,
            ..pending
        };

        if (session.received.len() as i64) < total {
            return Ok(pending);
        }
        // the janitor may have removed files behind the session's back
        let on_disk = chunk_indices_on_disk(&folder).await?;
        let complete = (0..total).all(|i| on_disk.contains(&i));
        session.received = on_disk;
        if !complete {
            return Ok(pending);
        }

        let filename = pending.filename.clone();
        let merged_path = self
            .settings
            .merge_dir
            .join(format!("{}-{}", upload_id, filename));
        let (hash, size) = match merge_chunks(&folder, total, &merged_path).await {
            Ok(merged) => merged,
            Err(err) => {
                let _ = fs::remove_file(&merged_path).await;
                return Err(err.into());
            }
        };
        info!(upload_id = %upload_id, file = %filename, total, "merged chunks");

        if let Err(err) = self.check_size(user, &filename, size) {
            // an oversized upload cannot be resumed into something valid
            let _ = fs::remove_file(&merged_path).await;
            if let Err(cleanup) = fs::remove_dir_all(&folder).await {
                warn!("failed to remove chunk dir {}: {}", folder.display(), cleanup);
            }
            *session = ChunkSession::default();
            return Err(err);
        }

        let persisted = self
            .persist(
                user,
                &filename,
                &hash,
                size,
                ObjectBody::File(merged_path.clone()),
            )
            .await;
        if let Err(err) = fs::remove_file(&merged_path).await {
            warn!("failed to remove merged file {}: {}", merged_path.display(), err);
        }
        // chunks stay on disk on failure so a resent chunk retries the merge
        let (resource_id, share_code) = persisted?;

        if let Err(err) = fs::remove_dir_all(&folder).await {
            warn!("failed to remove chunk dir {}: {}", folder.display(), err);
        }
        session.merged = true;
        self.forget_session(&upload_id);

        Ok(UploadOutcome {
            merged: true,
            upload_id,
            filename,
            size: Some(size as i64),
            skipped: duplicate,
            share_code: Some(share_code),
            resource_id: Some(resource_id),
            ..Default::default()
        })
    }

    /// Write to the active backend and record the resource with its share.
    async fn persist(
        &self,
        user: &User,
        filename: &str,
        hash: &str,
        size: u64,
        body: ObjectBody,
    ) -> UploadResult<(i64, String)> {
        let content_type = guess_mime(filename);
        let object_key = build_object_key(hash, filename, Local::now());
        let backend = self.registry.active();
        let stored = backend
            .write(&object_key, body, Some(size), &content_type)
            .await?;

        let created = self
            .resources
            .create_with_share(NewResource {
                filename: filename.to_string(),
                hash: hash.to_string(),
                content_type,
                stored_path: stored.to_string(),
                file_size: size as i64,
                user_id: user.id,
            })
            .await;
        let (resource, share) = match created {
            Ok(created) => created,
            Err(err) => {
                self.discard_unreferenced(backend.as_ref(), &stored).await;
                return Err(err.into());
            }
        };

        info!(
            user = %user.username,
            file = %filename,
            resource_id = resource.id,
            share = %share.code,
            "upload stored at {}",
            stored
        );
        Ok((resource.id, share.code))
    }

    /// Remove an object whose resource row could not be written, unless an
    /// earlier identical upload already owns the same key.
    async fn discard_unreferenced(&self, backend: &dyn StorageBackend, stored: &StoredPath) {
        match self.resources.count_by_stored_path(&stored.to_string()).await {
            Ok(0) => {
                if let Err(err) = backend.delete(stored).await {
                    warn!("failed to remove orphaned object {}: {}", stored, err);
                }
            }
            Ok(_) => debug!("object {} belongs to an earlier upload, keeping it", stored),
            Err(err) => warn!("could not check references to {}: {}", stored, err),
        }
    }

    fn session(&self, upload_id: &str) -> Arc<AsyncMutex<ChunkSession>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.entry(upload_id.to_string()).or_default().clone()
    }

    fn forget_session(&self, upload_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(upload_id);
    }

    /// Reclaim space from abandoned uploads once the chunk directory grows
    /// past `clean_limit`. Failures are logged and otherwise ignored.
    pub async fn sweep_chunks(&self) {
        let root = &self.settings.chunk_dir;
        let total = match dir_size(root).await {
            Ok(total) => total,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!("failed to measure chunk dir {}: {}", root.display(), err);
                return;
            }
        };
        if total <= self.settings.clean_limit {
            return;
        }

        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to list chunk dir {}: {}", root.display(), err);
                return;
            }
        };
        let now = SystemTime::now();
        let mut removed_files = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let folder = entry.path();
            {
                let session = self.session(&name);
                // leave uploads that are mid-request alone
                let Ok(_guard) = session.try_lock() else {
                    continue;
                };
                removed_files +=
                    remove_expired_files(&folder, now, self.settings.clean_expire).await;
                if count_entries(&folder).await.unwrap_or(1) == 0 {
                    if let Err(err) = fs::remove_dir_all(&folder).await {
                        debug!("failed to remove empty chunk dir {}: {}", folder.display(), err);
                    }
                }
            }
            self.release_idle_session(&name);
        }
        info!(
            "chunk janitor removed {} expired files (dir was {} bytes)",
            removed_files, total
        );
    }

    /// Drop a session entry nobody else is holding. Chunk state is rebuilt
    /// from disk on the next request.
    fn release_idle_session(&self, upload_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions
            .get(upload_id)
            .is_some_and(|session| Arc::strong_count(session) == 1)
        {
            sessions.remove(upload_id);
        }
    }
}

/// An upload id must be usable as exactly one path component.
pub fn validate_upload_id(upload_id: &str) -> UploadResult<()> {
    let invalid = upload_id.is_empty()
        || upload_id == "."
        || upload_id.contains("..")
        || upload_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        Err(UploadError::InvalidUploadId)
    } else {
        Ok(())
    }
}

async fn write_chunk(folder: &Path, chunk_path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = folder.join(format!(".part-{}", Uuid::new_v4()));
    let result = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        fs::rename(&tmp_path, chunk_path).await?;
        Ok::<_, io::Error>(())
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

/// Concatenate `0..total` into `target`, returning the MD5 hex and byte count.
async fn merge_chunks(folder: &Path, total: i64, target: &Path) -> io::Result<(String, u64)> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut out = File::create(target).await?;
    let mut digest = Context::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; MERGE_BUFFER_SIZE];

    for index in 0..total {
        let mut chunk = File::open(folder.join(index.to_string())).await?;
        loop {
            let n = chunk.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size += n as u64;
        }
    }
    out.flush().await?;
    out.sync_all().await?;

    Ok((format!("{:x}", digest.compute()), size))
}

async fn chunk_indices_on_disk(folder: &Path) -> io::Result<BTreeSet<i64>> {
    let mut indices = BTreeSet::new();
    let mut entries = match fs::read_dir(folder).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(indices),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(index) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i64>().ok())
            .filter(|index| *index >= 0)
        {
            indices.insert(index);
        }
    }
    Ok(indices)
}

async fn read_total(folder: &Path) -> Option<i64> {
    fs::read_to_string(folder.join(TOTAL_MARKER))
        .await
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .filter(|total| *total > 0)
}

async fn write_total(folder: &Path, total: i64) -> io::Result<()> {
    fs::write(folder.join(TOTAL_MARKER), total.to_string()).await
}

async fn count_entries(folder: &Path) -> io::Result<usize> {
    let mut entries = fs::read_dir(folder).await?;
    let mut count = 0;
    while entries.next_entry().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

async fn dir_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

async fn remove_expired_files(folder: &Path, now: SystemTime, expire: Duration) -> usize {
    let Ok(mut entries) = fs::read_dir(folder).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let expired = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > expire);
        if expired && fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    removed
}
