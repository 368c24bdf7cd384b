//! Share links: lookup by code, the access guard shared by the share-info and
//! download endpoints, and explicit (password-protected) share creation.

use crate::models::{
    share::{ShareLink, ShareRecord},
    user::User,
};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rand::{Rng, distributions::Alphanumeric};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info};

/// Length of a share code.
pub const SHARE_CODE_LEN: usize = 6;
/// Collisions tolerated before minting gives up.
const SHARE_CODE_ATTEMPTS: usize = 5;
const PASSWORD_MIN_CHARS: usize = 4;
const PASSWORD_MAX_CHARS: usize = 32;
/// Numeric expiry values above this are milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("share link is invalid")]
    InvalidCode,
    #[error("share not found")]
    NotFound,
    #[error("share has expired")]
    Expired,
    #[error("wrong password")]
    Unauthorized,
    #[error("resource id is required")]
    InvalidResource,
    #[error("share password must be 4-32 characters")]
    PasswordLength,
    #[error("invalid expire time format")]
    InvalidExpiry,
    #[error("expire time must be in the future")]
    ExpiryNotInFuture,
    #[error("resource {0} not found")]
    ResourceNotFound(i64),
    #[error("could not allocate a unique share code")]
    CodeExhausted,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type ShareResult<T> = Result<T, ShareError>;

/// Request body of an explicit share creation.
#[derive(Debug, Clone, Default)]
pub struct CreateShare {
    pub resource_id: i64,
    pub password: String,
    pub expire_time: Option<String>,
}

#[derive(Clone)]
pub struct ShareService {
    pub db: Arc<SqlitePool>,
}

impl ShareService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Resolve a public code to its share and resource.
    ///
    /// Malformed codes are reported the same way as unknown ones.
    pub async fn find_by_code(&self, code: &str) -> ShareResult<ShareRecord> {
        if !is_valid_code(code) {
            return Err(ShareError::InvalidCode);
        }
        sqlx::query_as::<_, ShareRecord>(
            "SELECT s.id AS share_id, s.code, s.resource_id, r.user_id AS owner_id,
                    r.filename, r.content_type, r.stored_path, r.file_size,
                    s.view_count, r.created_at, s.password, s.expire_time
             FROM shares s
             JOIN resources r ON r.id = s.resource_id
             WHERE s.code = ?
             LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ShareError::NotFound)
    }

    pub async fn increment_view_count(&self, share_id: i64) -> ShareResult<()> {
        sqlx::query("UPDATE shares SET view_count = view_count + 1 WHERE id = ?")
            .bind(share_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Create a password-protected share for a resource the caller owns.
    pub async fn create_share(&self, owner: &User, req: CreateShare) -> ShareResult<ShareLink> {
        if req.resource_id <= 0 {
            return Err(ShareError::InvalidResource);
        }
        let password = req.password.trim();
        let password_chars = password.chars().count();
        if !(PASSWORD_MIN_CHARS..=PASSWORD_MAX_CHARS).contains(&password_chars) {
            return Err(ShareError::PasswordLength);
        }
        let expire_time = parse_expire_time(req.expire_time.as_deref())?;
        if let Some(expire) = expire_time {
            if expire <= Utc::now() {
                return Err(ShareError::ExpiryNotInFuture);
            }
        }

        let owned: Option<i64> =
            sqlx::query_scalar("SELECT id FROM resources WHERE id = ? AND user_id = ?")
                .bind(req.resource_id)
                .bind(owner.id)
                .fetch_optional(&*self.db)
                .await?;
        if owned.is_none() {
            return Err(ShareError::ResourceNotFound(req.resource_id));
        }

        let mut conn = self.db.acquire().await?;
        let share = mint_share(
            &mut conn,
            req.resource_id,
            owner.id,
            Some(password),
            expire_time,
        )
        .await?;
        info!(
            user = %owner.username,
            resource_id = req.resource_id,
            code = %share.code,
            "created protected share"
        );
        Ok(share)
    }
}

/// Insert a new share row with a fresh random code, retrying on collisions.
///
/// Takes a bare connection so callers can run it inside their own transaction.
pub async fn mint_share(
    conn: &mut SqliteConnection,
    resource_id: i64,
    user_id: i64,
    password: Option<&str>,
    expire_time: Option<DateTime<Utc>>,
) -> ShareResult<ShareLink> {
    let password = password.filter(|p| !p.is_empty());
    for attempt in 1..=SHARE_CODE_ATTEMPTS {
        let code = random_code();
        let inserted = sqlx::query_as::<_, ShareLink>(
            "INSERT INTO shares (resource_id, user_id, code, password, expire_time, view_count, created_at)
             VALUES (?, ?, ?, ?, ?, 0, ?)
             RETURNING id, resource_id, user_id, code, password, expire_time, view_count, created_at",
        )
        .bind(resource_id)
        .bind(user_id)
        .bind(&code)
        .bind(password)
        .bind(expire_time)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await;

        match inserted {
            Ok(share) => return Ok(share),
            Err(err) if is_unique_violation(&err) => {
                debug!("share code {} collided (attempt {})", code, attempt);
            }
            Err(err) => return Err(ShareError::Sqlx(err)),
        }
    }
    Err(ShareError::CodeExhausted)
}

/// Decide whether `viewer` may see the share.
///
/// The owner always passes. Everyone else is subject to expiry first and the
/// password second, so an expired share stays gone even with the right
/// password.
pub fn check_access(
    record: &ShareRecord,
    viewer: Option<&User>,
    password: Option<&str>,
    now: DateTime<Utc>,
) -> ShareResult<()> {
    if viewer.is_some_and(|user| user.id == record.owner_id) {
        return Ok(());
    }
    if record.expire_time.is_some_and(|expire| now > expire) {
        return Err(ShareError::Expired);
    }
    let expected = match record.password.as_deref() {
        None | Some("") => return Ok(()),
        Some(expected) => expected,
    };
    let supplied = password.map(str::trim).unwrap_or_default();
    if supplied.is_empty() {
        return Err(ShareError::Unauthorized);
    }
    if bool::from(supplied.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ShareError::Unauthorized)
    }
}

/// `^[A-Za-z0-9]{6}$`
pub fn is_valid_code(code: &str) -> bool {
    code.len() == SHARE_CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Parse an expiry given as a Unix timestamp (seconds or milliseconds) or as
/// RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD` in server local time.
/// Blank input means "never expires".
pub fn parse_expire_time(raw: Option<&str>) -> ShareResult<Option<DateTime<Utc>>> {
    let value = match raw.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(value) => value,
    };

    if value.bytes().all(|b| b.is_ascii_digit()) {
        let mut ts: i64 = value.parse().map_err(|_| ShareError::InvalidExpiry)?;
        if ts > MILLIS_THRESHOLD {
            ts /= 1000;
        }
        return Utc
            .timestamp_opt(ts, 0)
            .single()
            .map(Some)
            .ok_or(ShareError::InvalidExpiry);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").or_else(|_| {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(|date| date.and_hms_opt(0, 0, 0).unwrap_or_default())
    });
    match naive {
        Ok(naive) => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| Some(local.with_timezone(&Utc)))
            .ok_or(ShareError::InvalidExpiry),
        Err(_) => Err(ShareError::InvalidExpiry),
    }
}

fn random_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SHARE_CODE_LEN)
        .map(char::from)
        .collect()
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
