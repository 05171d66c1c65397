//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fieldsync_engine::{ErrorKind, SessionId};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] fieldsync_engine::Error),

    #[error("Sync session {0} not found")]
    SessionNotFound(SessionId),

    /// The session failed earlier; every later request gets the same message.
    #[error("Sync session errored: {0}")]
    SessionErrored(String),

    #[error("Sync session {0} is already completed")]
    SessionCompleted(SessionId),

    #[error("Snapshot for session {0} is still in progress")]
    SnapshotInProgress(SessionId),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Engine(e) => match e.kind() {
                ErrorKind::Protocol => StatusCode::BAD_REQUEST,
                ErrorKind::Data => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::State => StatusCode::CONFLICT,
                ErrorKind::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionErrored(_) | AppError::SessionCompleted(_) => StatusCode::CONFLICT,
            AppError::SnapshotInProgress(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("Database error".to_string(), None)
            }
            AppError::Engine(e) if e.is_configuration() => {
                tracing::error!("Engine configuration error: {:?}", e);
                ("Sync configuration error".to_string(), Some(e.to_string()))
            }
            AppError::Engine(e) => {
                tracing::warn!("Engine error: {:?}", e);
                (e.to_string(), None)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ("Internal server error".to_string(), Some(msg.clone()))
            }
            other => (other.to_string(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
