//! The signed-in user's uploads: paginated listing and deletion.

use crate::{
    auth::RequireUser,
    errors::AppError,
    services::resource_service::{DEFAULT_PAGE_SIZE, GalleryPage},
    state::AppState,
};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct GalleryQuery {
    pub page: Option<String>,
    pub size: Option<String>,
}

/// `GET /api/gallery?page=&size=`
///
/// Non-numeric or non-positive paging values fall back to the defaults.
pub async fn list_gallery(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Query(query): Query<GalleryQuery>,
) -> Result<Json<GalleryPage>, AppError> {
    let page = positive_or(query.page.as_deref(), 1);
    let size = positive_or(query.size.as_deref(), DEFAULT_PAGE_SIZE);
    let listing = state.resources.list_by_user(&user, page, size).await?;
    debug!(
        user = %user.username,
        page = listing.page,
        size = listing.page_size,
        total = listing.total,
        "listed gallery"
    );
    Ok(Json(listing))
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    #[serde(default)]
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
}

/// `POST /api/gallery/delete`
pub async fn delete_resource(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Json(body): Json<DeleteBody>,
) -> Result<Json<DeleteResponse>, AppError> {
    if body.id <= 0 {
        return Err(AppError::bad_request("resource id is required"));
    }
    state.resources.delete(&user, body.id).await?;
    Ok(Json(DeleteResponse { success: true }))
}

fn positive_or(raw: Option<&str>, fallback: i64) -> i64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}
