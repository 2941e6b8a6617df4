//! Axum-specific error type and mappings from the domain errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use uwb_core::error::{CoreError, StoreError};
use uwb_runtime::ArchiveError;

/// HTTP-facing error; every variant carries the client-visible message.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Bad input; no job is created.
    #[error("{0}")]
    BadRequest(String),

    /// Unknown job/target/artifact.
    #[error("{0}")]
    NotFound(String),

    /// Missing or invalid token.
    #[error("{0}")]
    Unauthorized(String),

    /// Non-fast-forward pull and similar conflicts.
    #[error("{0}")]
    Conflict(String),

    /// Broker or store temporarily unavailable.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl HttpError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for HttpError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::BadRequest(msg),
            CoreError::NotFound(msg) => Self::NotFound(msg),
            CoreError::Auth(msg) => Self::Unauthorized(msg),
            CoreError::Conflict(msg) => Self::Conflict(msg),
            CoreError::Infra(msg) => Self::ServiceUnavailable(msg),
            CoreError::Store(err) => err.into(),
        }
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Storage(msg) => Self::Internal(format!("Storage: {msg}")),
            StoreError::Serialization(msg) => Self::Internal(format!("Serialization: {msg}")),
        }
    }
}

impl From<ArchiveError> for HttpError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(e) => Self::Internal(e.to_string()),
            // Unsafe paths, bad layout, corrupt files: the client sent them.
            other => Self::BadRequest(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(HttpError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(HttpError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            HttpError::from(CoreError::Conflict("pull".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HttpError::from(ArchiveError::UnsafePath("../evil".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
