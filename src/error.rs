//! Error types shared across the knowledge-base pipeline and the HTTP layer.
//!
//! Every fallible operation in the crate returns [`Error`]. The HTTP layer
//! converts it into a JSON body of the shape `{ "error": "<message>" }` via
//! the [`IntoResponse`] impl, mapping each kind to an appropriate status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::extract::ExtractError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("engine busy: {0}")]
    EngineBusy(String),

    #[error("embedding model changed (kb={kb}, current={current}); please reset the knowledge base")]
    EmbeddingModelMismatch { kb: String, current: String },

    #[error("sync already in progress")]
    SyncInProgress,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl Error {
    /// True when the error is the cooperative-cancellation marker.
    ///
    /// Cancellation is a control-flow signal, not a user-visible failure;
    /// handlers log it at debug level and report an empty result.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::SyncInProgress => StatusCode::CONFLICT,
            Error::InvalidInput(_) | Error::Unsupported(_) => StatusCode::BAD_REQUEST,
            Error::EmbeddingModelMismatch { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_flagged() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::SyncInProgress.is_cancelled());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::SyncInProgress.status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::EmbeddingModelMismatch {
                kb: "a".into(),
                current: "b".into()
            }
            .status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn extraction_errors_convert() {
        let err: Error = ExtractError::Unsupported("exe".into()).into();
        assert!(matches!(err, Error::Extract(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
