//! Error taxonomy for the monitor
//!
//! Transient fetch failures, duplicates and unchanged values never surface as
//! errors past their owning component; only the types below cross module
//! boundaries.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure inside a fetch collaborator. Never escapes the collaborator:
/// `PriceSource::fetch` and `RateSource::fetch` map it to `None`.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("parse error: {0}")]
    Parse(String),
}

/// A single send to a subscriber failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("subscriber connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Subscriber admission errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("too many connections: capacity {capacity} reached")]
    AtCapacity { capacity: usize },
}

/// Snapshot serialization failed. This is a defect, not a runtime condition.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// HTTP-facing error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Snapshot(#[from] SnapshotError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, "UNAUTHORIZED"),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            AppError::Snapshot(e) => {
                tracing::error!(error = %e, "snapshot build failed while serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}
