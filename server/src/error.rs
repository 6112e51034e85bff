//! Unified error handling for the server.

use crate::config::ConfigError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Sync service error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Target database unreachable or rejected the write
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] rowsync_engine::Error),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the failure is in the transport to a target store.
    ///
    /// Transport failures must not advance the feed position, so the event is
    /// delivered again. Constraint violations reported by the database are
    /// rejections of this write and would fail the same way on redelivery.
    pub fn is_transport(&self) -> bool {
        match self {
            SyncError::Database(sqlx::Error::Database(e)) => {
                !matches!(
                    e.kind(),
                    sqlx::error::ErrorKind::UniqueViolation
                        | sqlx::error::ErrorKind::ForeignKeyViolation
                        | sqlx::error::ErrorKind::NotNullViolation
                        | sqlx::error::ErrorKind::CheckViolation
                )
            }
            SyncError::Database(_) => true,
            _ => false,
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

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            SyncError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Database error".to_string(),
                    None,
                )
            }
            SyncError::Engine(e) => (StatusCode::BAD_REQUEST, e.to_string(), None),
            other => {
                tracing::error!("Internal error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(other.to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, SyncError>;
