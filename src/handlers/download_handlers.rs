//! `GET|HEAD /r/{code}`: serve a shared resource.
//!
//! Remote objects are answered with a redirect to a presigned URL. Local
//! objects are streamed with weak-ETag/Last-Modified revalidation and
//! single-range support.

use crate::{
    auth::CurrentUser,
    errors::AppError,
    models::share::ShareRecord,
    services::share_service::check_access,
    state::AppState,
    storage::{DEFAULT_SIGNED_URL_TTL, ReadLocation, stored_path::guess_mime},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{io::SeekFrom, path::Path as FsPath, time::SystemTime};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";
const CACHE_CONTROL: &str = "public, max-age=0, must-revalidate";

#[derive(Debug, Default, Deserialize)]
pub struct PasswordQuery {
    pub pwd: Option<String>,
}

pub async fn download_share(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<PasswordQuery>,
    CurrentUser(viewer): CurrentUser,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let record = state.shares.find_by_code(&code).await?;
    check_access(&record, viewer.as_ref(), query.pwd.as_deref(), Utc::now())?;

    if let Err(err) = state.shares.increment_view_count(record.share_id).await {
        warn!("failed to bump view count for {}: {}", code, err);
    }

    let (backend, path) = state.registry.by_stored_path(&record.stored_path)?;
    debug!(code = %code, file = %record.filename, storage = %backend.platform(), "serving share");

    match backend.resolve_for_read(&path, DEFAULT_SIGNED_URL_TTL).await? {
        ReadLocation::SignedUrl(url) => {
            let location = HeaderValue::from_str(&url)
                .map_err(|_| AppError::internal("invalid signed url"))?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
        ReadLocation::Local(file_path) => serve_local(&record, &file_path, &method, &headers).await,
    }
}

async fn serve_local(
    record: &ShareRecord,
    file_path: &FsPath,
    method: &Method,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let gone = |err: std::io::Error| {
        warn!("shared file {} unavailable: {}", file_path.display(), err);
        AppError::new(StatusCode::GONE, "file is no longer available")
    };
    let mut file = File::open(file_path).await.map_err(gone)?;
    let meta = file.metadata().await.map_err(gone)?;
    let size = meta.len();
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let modified: DateTime<Utc> = modified.into();

    let etag = weak_etag(size, &modified);
    let mut response_headers = HeaderMap::new();
    insert_header(&mut response_headers, header::ETAG, &etag);
    insert_header(
        &mut response_headers,
        header::LAST_MODIFIED,
        &modified.format(HTTP_DATE_FORMAT).to_string(),
    );
    insert_header(&mut response_headers, header::CACHE_CONTROL, CACHE_CONTROL);
    insert_header(&mut response_headers, header::VARY, "Range");
    insert_header(&mut response_headers, header::ACCEPT_RANGES, "bytes");

    if is_not_modified(headers, &etag, &modified) {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let content_type = if record.content_type.is_empty() {
        guess_mime(&record.filename)
    } else {
        record.content_type.clone()
    };
    insert_header(&mut response_headers, header::CONTENT_TYPE, &content_type);
    insert_header(
        &mut response_headers,
        header::CONTENT_DISPOSITION,
        &content_disposition(&record.filename),
    );

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let (status, length) = match range {
        Some(raw) => {
            let Some((start, end)) = parse_range(raw, size) else {
                let mut headers = response_headers;
                insert_header(
                    &mut headers,
                    header::CONTENT_RANGE,
                    &format!("bytes */{}", size),
                );
                let mut response = AppError::new(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "requested range not satisfiable",
                )
                .into_response();
                response.headers_mut().extend(headers);
                return Ok(response);
            };
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| AppError::internal(format!("seek failed: {e}")))?;
            insert_header(
                &mut response_headers,
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", start, end, size),
            );
            (StatusCode::PARTIAL_CONTENT, end - start + 1)
        }
        None => (StatusCode::OK, size),
    };
    insert_header(
        &mut response_headers,
        header::CONTENT_LENGTH,
        &length.to_string(),
    );

    if method == Method::HEAD {
        return Ok((status, response_headers).into_response());
    }

    info!(code = %record.code, file = %record.filename, bytes = length, "streaming share");
    let body = Body::from_stream(ReaderStream::new(file.take(length)));
    Ok((status, response_headers, body).into_response())
}

/// `W/"<size hex>-<mtime nanos hex>"`
fn weak_etag(size: u64, modified: &DateTime<Utc>) -> String {
    let nanos = modified.timestamp_nanos_opt().unwrap_or_default();
    format!("W/\"{:x}-{:x}\"", size, nanos)
}

fn is_not_modified(headers: &HeaderMap, etag: &str, modified: &DateTime<Utc>) -> bool {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if !if_none_match.is_empty()
        && (if_none_match == "*" || if_none_match.split(',').any(|tag| tag.trim() == etag))
    {
        return true;
    }

    let since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok());
    match since {
        // mtime is compared at one-second resolution, as sent in Last-Modified
        Some(since) => modified.timestamp() <= since.timestamp(),
        None => false,
    }
}

/// Parse a single `bytes=start-end` range. The end is optional and clamped
/// to the last byte.
fn parse_range(raw: &str, size: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    if start >= size {
        return None;
    }
    let end = match end.trim() {
        "" => size - 1,
        end => {
            let end: u64 = end.parse().ok()?;
            if end < start {
                return None;
            }
            end.min(size - 1)
        }
    };
    Some((start, end))
}

/// `inline` disposition with an ASCII fallback name and the UTF-8 original.
fn content_disposition(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let ascii: String = base
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();
    format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(base)
    )
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
