//! Error taxonomy for the relay.
//!
//! Engine handlers surface these to the dispatcher, which logs and swallows
//! them. HTTP handlers turn them into JSON error bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A required field was missing or blank.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A non-admin invoked an admin-only operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The idempotency token already belongs to a persisted message.
    #[error("Duplicate idempotency token (existing message {existing_id})")]
    Conflict { existing_id: i64 },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = Json(json!({
            "error": {
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}
