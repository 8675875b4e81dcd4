use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Machine-readable error kind carried in the failure envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    PayloadTooLarge,
    UnsupportedMediaType,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Lost an assignment race, or tried to mutate a closed session.
    #[error("{0}")]
    Conflict(String),

    /// Acting outside one's role or ownership.
    #[error("{0}")]
    Forbidden(String),

    #[error("payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("media type {0} is not accepted for images")]
    UnsupportedMediaType(String),

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Validation(_) => ErrorKind::Validation,
            ChatError::NotFound(_) => ErrorKind::NotFound,
            ChatError::Conflict(_) => ErrorKind::Conflict,
            ChatError::Forbidden(_) => ErrorKind::Forbidden,
            ChatError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            ChatError::UnsupportedMediaType(_) => ErrorKind::UnsupportedMediaType,
            ChatError::Unauthorized => ErrorKind::Unauthorized,
            ChatError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn chat_not_found(chat_id: &str) -> Self {
        ChatError::NotFound(format!("chat {} not found", chat_id))
    }

    pub fn chat_closed(chat_id: &str) -> Self {
        ChatError::Conflict(format!("chat {} is closed", chat_id))
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::Internal(err.into())
    }
}

/// Uniform failure envelope: `{"error": {"kind": ..., "message": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let message = match &self {
            // Storage details stay in the log.
            ChatError::Internal(e) => {
                error!("Internal error: {:#}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let envelope = ErrorEnvelope {
            error: ErrorBody { kind, message },
        };
        (kind.status(), Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_distinct_statuses() {
        assert_eq!(ChatError::Unauthorized.kind().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ChatError::chat_closed("c").kind().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ChatError::PayloadTooLarge { size: 2, limit: 1 }.kind().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn envelope_uses_snake_case_kind() {
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                kind: ErrorKind::UnsupportedMediaType,
                message: "nope".into(),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["kind"], "unsupported_media_type");
    }
}
