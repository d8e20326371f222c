use crate::services::{
    import_service::ImportError, status_store::StatusStoreError,
    upload_validator::ValidationError,
};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

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

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
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

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::TooLarge { .. } | ValidationError::UnpackedTooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            other => AppError::bad_request(other.to_string()),
        }
    }
}

impl From<StatusStoreError> for AppError {
    fn from(err: StatusStoreError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<ImportError> for AppError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Validation(inner) => inner.into(),
            ImportError::Staging(inner) => {
                AppError::internal(format!("could not stage uploaded file: {}", inner))
            }
            ImportError::Store(inner) => inner.into(),
            ImportError::Aborted(msg) => AppError::internal(msg),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn size_violations_map_to_payload_too_large() {
        let too_large: AppError = ValidationError::TooLarge {
            name: "data.gz".into(),
            size: 10,
            limit: 8,
        }
        .into();
        assert_eq!(too_large.status, StatusCode::PAYLOAD_TOO_LARGE);

        let unpacked: AppError = ImportError::Validation(ValidationError::UnpackedTooLarge {
            name: "data.gz".into(),
            limit: 4096,
        })
        .into();
        assert_eq!(unpacked.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(unpacked.message.contains("4096"));
    }

    #[test]
    fn other_validation_errors_are_bad_requests() {
        let err: AppError = ValidationError::MissingFile.into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn staging_failure_is_internal() {
        let err: AppError = ImportError::Staging(io::Error::other("disk full")).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "could not stage uploaded file: disk full");
    }
}
