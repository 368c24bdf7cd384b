//! Share metadata and explicit share creation.

use crate::{
    auth::{CurrentUser, RequireUser},
    errors::AppError,
    handlers::download_handlers::PasswordQuery,
    models::share::ShareInfo,
    services::share_service::{CreateShare, check_access},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// `GET /api/share/{code}?pwd=`
///
/// Same gate as the download route. Never exposes the password or the
/// stored path.
pub async fn share_info(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<PasswordQuery>,
    CurrentUser(viewer): CurrentUser,
) -> Result<Json<ShareInfo>, AppError> {
    let record = state.shares.find_by_code(&code).await?;
    check_access(&record, viewer.as_ref(), query.pwd.as_deref(), Utc::now())?;
    debug!(code = %code, file = %record.filename, "share info");
    Ok(Json(ShareInfo::from(&record)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareBody {
    #[serde(default)]
    pub resource_id: i64,
    #[serde(default)]
    pub password: String,
    pub expire_time: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateShareResponse {
    pub code: String,
}

/// `POST /api/share`
pub async fn create_share(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Json(body): Json<CreateShareBody>,
) -> Result<Json<CreateShareResponse>, AppError> {
    let share = state
        .shares
        .create_share(
            &user,
            CreateShare {
                resource_id: body.resource_id,
                password: body.password,
                expire_time: body.expire_time,
            },
        )
        .await?;
    Ok(Json(CreateShareResponse { code: share.code }))
}
