//! Share links: public six-character codes pointing at one resource.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A row of the `shares` table.
#[derive(Serialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ShareLink {
    pub id: i64,
    pub resource_id: i64,
    pub user_id: i64,
    pub code: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub expire_time: Option<DateTime<Utc>>,
    pub view_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A share joined with the resource it points at. This is what the access
/// guard and the download path work with.
#[derive(Clone, FromRow, Debug)]
pub struct ShareRecord {
    pub share_id: i64,
    pub code: String,
    pub resource_id: i64,
    /// Owner of the resource (and of the share).
    pub owner_id: i64,
    pub filename: String,
    pub content_type: String,
    pub stored_path: String,
    pub file_size: i64,
    pub view_count: i64,
    pub created_at: DateTime<Utc>,
    pub password: Option<String>,
    pub expire_time: Option<DateTime<Utc>>,
}

/// Public view of a share returned by the share-info endpoint.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    pub code: String,
    pub resource_id: i64,
    pub filename: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub file_size: i64,
    pub view_count: i64,
    pub created_at: DateTime<Utc>,
    pub expire_time: Option<DateTime<Utc>>,
    pub has_password: bool,
}

impl From<&ShareRecord> for ShareInfo {
    fn from(record: &ShareRecord) -> Self {
        Self {
            code: record.code.clone(),
            resource_id: record.resource_id,
            filename: record.filename.clone(),
            content_type: record.content_type.clone(),
            file_size: record.file_size,
            view_count: record.view_count,
            created_at: record.created_at,
            expire_time: record.expire_time,
            has_password: record
                .password
                .as_deref()
                .is_some_and(|p| !p.is_empty()),
        }
    }
}
