use crate::{
    services::{
        resource_service::ResourceError, share_service::ShareError, upload_service::UploadError,
    },
    storage::StorageError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    /// Log the underlying cause and hide it from the client.
    fn storage_failure(context: &str, err: &dyn std::error::Error) -> Self {
        error!("{}: {}", context, err);
        Self::internal("storage failure")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!("internal error: {:#}", err);
        AppError::internal("internal error")
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::storage_failure("storage backend error", &err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::storage_failure("database error", &err)
    }
}

impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        let status = match &err {
            ShareError::InvalidCode | ShareError::NotFound | ShareError::ResourceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ShareError::Expired => StatusCode::GONE,
            ShareError::Unauthorized => StatusCode::UNAUTHORIZED,
            ShareError::InvalidResource
            | ShareError::PasswordLength
            | ShareError::InvalidExpiry
            | ShareError::ExpiryNotInFuture => StatusCode::BAD_REQUEST,
            ShareError::CodeExhausted | ShareError::Sqlx(_) => {
                return AppError::storage_failure("share persistence failed", &err);
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<ResourceError> for AppError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::NotFound(_) => AppError::not_found(err.to_string()),
            ResourceError::Share(share) => share.into(),
            ResourceError::Storage(storage) => storage.into(),
            ResourceError::Sqlx(db) => db.into(),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Resource(inner) => inner.into(),
            UploadError::Storage(_) | UploadError::Io(_) => {
                AppError::storage_failure("upload failed", &err)
            }
            UploadError::GuestForbidden => AppError::new(StatusCode::FORBIDDEN, err.to_string()),
            UploadError::InvalidUploadId
            | UploadError::InvalidFilename
            | UploadError::ChunkParamsInvalid
            | UploadError::FileTooLarge
            | UploadError::LoginRequired => AppError::bad_request(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_errors_map_to_statuses() {
        let cases: Vec<(AppError, StatusCode)> = vec![
            (ShareError::Expired.into(), StatusCode::GONE),
            (ShareError::Unauthorized.into(), StatusCode::UNAUTHORIZED),
            (ShareError::InvalidCode.into(), StatusCode::NOT_FOUND),
            (ShareError::PasswordLength.into(), StatusCode::BAD_REQUEST),
            (UploadError::GuestForbidden.into(), StatusCode::FORBIDDEN),
            (UploadError::LoginRequired.into(), StatusCode::BAD_REQUEST),
            (ResourceError::NotFound(3).into(), StatusCode::NOT_FOUND),
            (
                StorageError::BackendNotConfigured(crate::storage::Platform::S3).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status, status, "{}", err.message);
        }
    }

    #[test]
    fn storage_details_are_not_leaked() {
        let err: AppError = StorageError::Remote("secret endpoint http://10.0.0.1".into()).into();
        assert_eq!(err.message, "storage failure");
    }
}
