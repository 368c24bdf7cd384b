//! An uploaded file and where its bytes live.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A stored file. Rows are never updated; they are only inserted after a
/// successful write and removed by the delete flow.
#[derive(Serialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: i64,

    /// Original file name as uploaded.
    pub filename: String,

    /// MD5 of the content, lowercase hex.
    pub hash: String,

    /// MIME type recorded at upload time.
    pub content_type: String,

    /// Backend-qualified locator, see `storage::StoredPath`.
    #[serde(skip_serializing)]
    pub stored_path: String,

    pub file_size: i64,

    /// Owner. Anonymous uploads belong to the guest user.
    pub user_id: i64,

    pub created_at: DateTime<Utc>,
}

/// Fields needed to insert a resource.
#[derive(Debug, Clone)]
pub struct NewResource {
    pub filename: String,
    pub hash: String,
    pub content_type: String,
    pub stored_path: String,
    pub file_size: i64,
    pub user_id: i64,
}

/// One row of the owner's gallery listing.
#[derive(Serialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GalleryItem {
    pub id: i64,
    pub filename: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
    /// Latest password-free share code, if any.
    pub share_code: Option<String>,
}
