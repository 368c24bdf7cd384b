//! HTTP surface of the file-share service.
//!
//! ## Structure
//! - **Delivery**
//!   - `GET|HEAD /r/{code}` — download a shared file (`?pwd=` for protected shares)
//!   - `GET  /api/share/{code}` — share metadata
//!
//! - **Upload**
//!   - `POST /api/upload` — multipart upload, single-shot or one chunk
//!   - `GET  /api/upload?uploadId=` — chunk indices already received
//!
//! - **Owner** (session required)
//!   - `POST /api/share` — create a password-protected share
//!   - `GET  /api/gallery` — list own uploads
//!   - `POST /api/gallery/delete` — delete an upload and its shares

use crate::{
    handlers::{
        download_handlers::download_share,
        gallery_handlers::{delete_resource, list_gallery},
        health_handlers::{healthz, readyz},
        share_handlers::{create_share, share_info},
        upload_handlers::{upload, upload_progress},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Multipart bodies may be this much larger than the chunk threshold.
const UPLOAD_BODY_SLACK: usize = 1024 * 1024;
/// Floor for the upload body limit, so small thresholds still admit
/// reasonably sized chunks.
const MIN_UPLOAD_BODY: usize = 8 * 1024 * 1024;

/// Build the router. The shared state is supplied by the caller via
/// `with_state`.
///
/// `chunk_threshold` bounds the upload request body: larger files must be
/// sent in chunks.
pub fn routes(chunk_threshold: u64) -> Router<AppState> {
    let upload_limit = usize::try_from(chunk_threshold)
        .unwrap_or(usize::MAX)
        .max(MIN_UPLOAD_BODY)
        .saturating_add(UPLOAD_BODY_SLACK);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // delivery
        .route("/r/{code}", get(download_share).head(download_share))
        .route("/api/share/{code}", get(share_info))
        .route("/api/share", post(create_share))
        // upload
        .route(
            "/api/upload",
            post(upload)
                .get(upload_progress)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        // owner
        .route("/api/gallery", get(list_gallery))
        .route("/api/gallery/delete", post(delete_resource))
}
