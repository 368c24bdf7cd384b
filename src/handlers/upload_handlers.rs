//! Upload endpoints: multipart upload (single-shot or chunked) and chunk
//! progress for resuming.

use crate::{
    auth::CurrentUser,
    errors::AppError,
    services::upload_service::{UploadOutcome, UploadRequest},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Query, State, multipart::MultipartError},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

const FILE_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressQuery {
    pub upload_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub uploaded: Vec<i64>,
}

/// `GET /api/upload?uploadId=`
pub async fn upload_progress(
    State(state): State<AppState>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<ProgressResponse>, AppError> {
    let upload_id = query
        .upload_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("missing uploadId"))?;
    let uploaded = state.uploads.uploaded_chunks(upload_id.trim()).await?;
    Ok(Json(ProgressResponse { uploaded }))
}

/// `POST /api/upload`
///
/// Anonymous callers upload as the guest user, subject to the guest policy.
pub async fn upload(
    State(state): State<AppState>,
    current: CurrentUser,
    multipart: Multipart,
) -> Result<Json<UploadOutcome>, AppError> {
    let user = current.or_guest();
    let request = read_upload_form(multipart).await?;
    debug!(
        user = %user.username,
        file = %request.filename,
        bytes = request.data.len(),
        "received upload form"
    );
    let outcome = state.uploads.handle(&user, request).await?;
    Ok(Json(outcome))
}

/// Decode the multipart form into an [`UploadRequest`]. Exactly one `file`
/// part is required; unparseable numeric fields are treated as absent.
async fn read_upload_form(mut multipart: Multipart) -> Result<UploadRequest, AppError> {
    let mut file: Option<(Option<String>, Bytes)> = None;
    let mut file_parts = 0usize;
    let mut upload_id = None;
    let mut file_name = None;
    let mut file_size = None;
    let mut chunk_index = None;
    let mut total_chunks = None;
    let mut chunk_size = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == FILE_FIELD {
            file_parts += 1;
            let original = field.file_name().map(str::to_string);
            let data = field.bytes().await.map_err(bad_form)?;
            file = Some((original, data));
            continue;
        }

        let value = field.text().await.map_err(bad_form)?;
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match name.as_str() {
            "uploadId" => upload_id = Some(value.to_string()),
            "fileName" => file_name = Some(value.to_string()),
            "fileSize" => file_size = value.parse::<u64>().ok(),
            "chunkIndex" => chunk_index = value.parse::<i64>().ok(),
            "totalChunks" => total_chunks = value.parse::<i64>().ok(),
            "chunkSize" => chunk_size = value.parse::<i64>().ok(),
            _ => {}
        }
    }

    let (original_name, data) = match (file, file_parts) {
        (Some(file), 1) => file,
        _ => return Err(AppError::bad_request("exactly one file is required")),
    };
    let filename = file_name
        .or(original_name)
        .map(|name| base_name(&name).to_string())
        .unwrap_or_default();

    Ok(UploadRequest {
        upload_id,
        filename,
        file_size,
        chunk_index,
        total_chunks,
        chunk_size,
        data,
    })
}

fn bad_form(err: MultipartError) -> AppError {
    AppError::bad_request(format!("invalid upload form: {}", err.body_text()))
}

/// Last path component, accepting either separator.
fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{services::upload_service::GuestPolicy, test_support::TestApp};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "linkit-test-boundary";

    /// Build a multipart body from text fields plus an optional file part.
    fn form(fields: &[(&str, &str)], files: &[(&str, &str)]) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (filename, data) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    fn upload_request(body: Body, cookie: Option<String>) -> Request<Body> {
        let mut builder = Request::post("/api/upload").header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(body).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("C:\\Users\\me\\a.txt"), "a.txt");
        assert_eq!(base_name("dir/sub/b.txt"), "b.txt");
        assert_eq!(base_name("c.txt"), "c.txt");
    }

    #[tokio::test]
    async fn single_shot_upload_then_download() {
        let app = TestApp::new().await;
        let response = app
            .router()
            .oneshot(upload_request(
                form(&[], &[("dir/hello.txt", "hello")]),
                Some(app.owner_cookie()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["merged"], true);
        assert_eq!(body["filename"], "hello.txt");
        assert_eq!(body["size"], 5);
        assert!(body.get("skipped").is_none());
        assert!(body.get("chunkIndex").is_none());
        let code = body["shareCode"].as_str().unwrap().to_string();

        let download = app
            .router()
            .oneshot(Request::get(format!("/r/{code}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(download.status(), StatusCode::OK);
        let bytes = to_bytes(download.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn chunked_upload_with_progress() {
        let app = TestApp::new().await;
        let cookie = app.owner_cookie();
        let chunk = |index: &str, data: &str| {
            form(
                &[
                    ("uploadId", "movie-1"),
                    ("fileName", "movie.bin"),
                    ("fileSize", "12"),
                    ("chunkIndex", index),
                    ("totalChunks", "2"),
                    ("chunkSize", "6"),
                ],
                &[("blob", data)],
            )
        };

        let first = app
            .router()
            .oneshot(upload_request(chunk("1", "world!"), Some(cookie.clone())))
            .await
            .unwrap();
        let first = json_body(first).await;
        assert_eq!(first["merged"], false);
        assert_eq!(first["chunkIndex"], 1);
        assert_eq!(first["totalChunks"], 2);
        assert_eq!(first["chunkSize"], 6);

        let progress = app
            .router()
            .oneshot(
                Request::get("/api/upload?uploadId=movie-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(progress).await["uploaded"], serde_json::json!([1]));

        let last = app
            .router()
            .oneshot(upload_request(chunk("0", "hello "), Some(cookie)))
            .await
            .unwrap();
        let last = json_body(last).await;
        assert_eq!(last["merged"], true);
        assert_eq!(last["size"], 12);
        assert_eq!(last["filename"], "movie.bin");
        assert!(last["resourceId"].as_i64().is_some());
    }

    #[tokio::test]
    async fn form_validation() {
        let app = TestApp::new().await;

        let no_file = app
            .router()
            .oneshot(upload_request(form(&[("fileName", "a.txt")], &[]), Some(app.owner_cookie())))
            .await
            .unwrap();
        assert_eq!(no_file.status(), StatusCode::BAD_REQUEST);

        let two_files = app
            .router()
            .oneshot(upload_request(
                form(&[], &[("a.txt", "a"), ("b.txt", "b")]),
                Some(app.owner_cookie()),
            ))
            .await
            .unwrap();
        assert_eq!(two_files.status(), StatusCode::BAD_REQUEST);

        let bad_chunk = app
            .router()
            .oneshot(upload_request(
                form(
                    &[("uploadId", "x"), ("chunkIndex", "5"), ("totalChunks", "2")],
                    &[("big.bin", "0123456789")],
                ),
                Some(app.owner_cookie()),
            ))
            .await
            .unwrap();
        assert_eq!(bad_chunk.status(), StatusCode::BAD_REQUEST);

        let progress = app
            .router()
            .oneshot(Request::get("/api/upload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(progress.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn anonymous_uploads_follow_guest_policy() {
        let closed = TestApp::new().await;
        let forbidden = closed
            .router()
            .oneshot(upload_request(form(&[], &[("a.png", "png")]), None))
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let open = TestApp::with_guest_policy(GuestPolicy::new(true, 1, "png")).await;
        let wrong_ext = open
            .router()
            .oneshot(upload_request(form(&[], &[("a.exe", "exe")]), None))
            .await
            .unwrap();
        assert_eq!(wrong_ext.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(wrong_ext).await["error"], "please log in to upload");

        let allowed = open
            .router()
            .oneshot(upload_request(form(&[], &[("a.png", "png")]), None))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        let owner: i64 = sqlx::query_scalar("SELECT user_id FROM resources")
            .fetch_one(&*open.state.db)
            .await
            .unwrap();
        assert_eq!(owner, crate::models::user::GUEST_USER_ID);
    }
}
