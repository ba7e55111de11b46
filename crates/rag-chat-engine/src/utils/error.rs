use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to callers of the engine.
///
/// Messages are user-safe: gateway detail is logged where the failure
/// happens and never carried in the variant payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Stable error kind, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    StorageUnavailable,
    RetrievalUnavailable,
    GenerationFailed,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::StorageUnavailable => "StorageUnavailable",
            Self::RetrievalUnavailable => "RetrievalUnavailable",
            Self::GenerationFailed => "GenerationFailed",
            Self::InvalidRequest => "InvalidRequest",
        }
    }
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::RetrievalUnavailable(_) => ErrorKind::RetrievalUnavailable,
            Self::GenerationFailed(_) => ErrorKind::GenerationFailed,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::StorageUnavailable(m)
            | Self::RetrievalUnavailable(m)
            | Self::GenerationFailed(m)
            | Self::InvalidRequest(m) => m,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::StorageUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RetrievalUnavailable(_) | Self::GenerationFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();

        if self.is_client_error() {
            tracing::warn!(kind = kind.as_str(), "{}", self);
        } else {
            tracing::error!(kind = kind.as_str(), "{}", self);
        }

        let body = Json(ErrorResponse {
            error: kind.as_str().to_string(),
            message: self.message().to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ChatError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ChatError::InvalidRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert!(ChatError::StorageUnavailable("x".into())
            .status_code()
            .is_server_error());
        assert!(ChatError::RetrievalUnavailable("x".into())
            .status_code()
            .is_server_error());
        assert!(ChatError::GenerationFailed("x".into())
            .status_code()
            .is_server_error());
    }

    #[test]
    fn test_kind_is_stable() {
        let err = ChatError::RetrievalUnavailable("all variants failed".into());
        assert_eq!(err.kind(), ErrorKind::RetrievalUnavailable);
        assert_eq!(err.kind().as_str(), "RetrievalUnavailable");
        assert_eq!(err.message(), "all variants failed");
    }
}
