//! Error types for the API service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use podgate_core::EngineError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur while serving the API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or missing request parameters.
    #[error("{0}")]
    BadRequest(String),

    /// The addressed object does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Server error.
    #[error("{0}")]
    Server(String),

    /// Error returned by the engine.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Engine(e) => match e {
                EngineError::ContainerNotFound(_)
                | EngineError::ImageNotFound(_)
                | EngineError::PodNotFound(_)
                | EngineError::ReferenceNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                EngineError::Conflict(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Server(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short, stable description of the error class.
    #[must_use]
    pub fn cause(&self) -> String {
        match self {
            Self::Engine(e) => match e {
                EngineError::ContainerNotFound(_) => "no such container".to_string(),
                EngineError::ImageNotFound(_) => "no such image".to_string(),
                EngineError::PodNotFound(_) => "no such pod".to_string(),
                EngineError::ReferenceNotFound(_) => "image not known".to_string(),
                EngineError::InvalidArgument(_) => "invalid argument".to_string(),
                EngineError::Conflict(_) => "conflict".to_string(),
                EngineError::Cancelled => "operation cancelled".to_string(),
                other => other.to_string(),
            },
            other => other
                .status_code()
                .canonical_reason()
                .unwrap_or("error")
                .to_lowercase(),
        }
    }
}

/// Error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorModel {
    /// Root cause, suitable for matching.
    pub cause: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status code.
    pub response: u16,
}

impl ErrorModel {
    /// Builds an error body for `status`.
    #[must_use]
    pub fn new(status: StatusCode, cause: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            message: message.into(),
            response: status.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        let body = ErrorModel::new(status, self.cause(), self.to_string());
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_class() {
        let conflict = ApiError::from(EngineError::Conflict("name in use".to_string()));
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(conflict.cause(), "conflict");

        let missing = ApiError::from(EngineError::ImageNotFound("alpine".to_string()));
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(missing.cause(), "no such image");

        let bad = ApiError::BadRequest("reference is required".to_string());
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(bad.cause(), "bad request");

        let io = ApiError::from(std::io::Error::other("disk full"));
        assert_eq!(io.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(io.cause(), "internal server error");
    }
}
