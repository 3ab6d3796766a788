//! # Error Handling
//!
//! The HTTP-facing error type and how each failure becomes a response.
//!
//! The job engine, model registry and upload layer each have their own
//! `thiserror` enums; this module maps them onto status codes so handlers
//! can simply use `?`.
//!
//! ## Response Body:
//! Every error renders the same JSON shape:
//! ```json
//! {"error": {"type": "not_ready", "message": "...", "timestamp": "..."}}
//! ```
//! with an optional `detail` object (e.g. the failure of a FAILED job).
//!
//! ## Status Mapping:
//! - 400: validation and malformed requests
//! - 404: unknown job
//! - 409: not ready, already terminal, contended job
//! - 413: upload too large
//! - 503: queue full, store unavailable, shutting down
//! - 500: everything else

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::jobs::{JobError, StoreError};
use crate::transcription::ModelError;
use crate::upload::UploadError;

#[derive(Debug)]
pub enum AppError {
    Internal(String),

    BadRequest(String),

    NotFound(String),

    ConfigError(String),

    ValidationError(String),

    PayloadTooLarge(String),

    /// The request conflicts with the job's current state.
    Conflict {
        kind: &'static str,
        message: String,
        detail: Option<serde_json::Value>,
    },

    /// Temporarily unable to serve; the client may retry.
    Unavailable { kind: &'static str, message: String },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::Conflict { message, .. } => write!(f, "Conflict: {}", message),
            AppError::Unavailable { message, .. } => write!(f, "Service unavailable: {}", message),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", msg.clone()),
            AppError::Conflict { kind, message, .. } => (StatusCode::CONFLICT, kind, message.clone()),
            AppError::Unavailable { kind, message } => (StatusCode::SERVICE_UNAVAILABLE, kind, message.clone()),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        let mut error = json!({
            "type": error_type,
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        if let AppError::Conflict { detail: Some(detail), .. } = self {
            error["detail"] = detail.clone();
        }

        HttpResponse::build(status).json(json!({ "error": error }))
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err {
            JobError::NotFound(_) => AppError::NotFound(message),
            JobError::NotReady { state, error_detail, .. } => AppError::Conflict {
                kind: "not_ready",
                message,
                detail: Some(json!({ "status": state, "error_detail": error_detail })),
            },
            JobError::AlreadyTerminal { state, .. } => AppError::Conflict {
                kind: "already_terminal",
                message,
                detail: Some(json!({ "status": state })),
            },
            JobError::ConcurrentModification { .. } => AppError::Conflict {
                kind: "concurrent_modification",
                message,
                detail: None,
            },
            JobError::InvalidTransition { .. } => AppError::Conflict {
                kind: "invalid_transition",
                message,
                detail: None,
            },
            JobError::Capacity { .. } => AppError::Unavailable {
                kind: "capacity_exceeded",
                message,
            },
            JobError::Store(StoreError::Unavailable(_)) => AppError::Unavailable {
                kind: "store_unavailable",
                message,
            },
            JobError::ShuttingDown => AppError::Unavailable {
                kind: "shutting_down",
                message,
            },
            JobError::Store(_) => AppError::Internal(message),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::TooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            UploadError::Io(_) => AppError::Internal(err.to_string()),
            other => AppError::ValidationError(other.to_string()),
        }
    }
}

impl From<ModelError> for AppError {
    fn from(err: ModelError) -> Self {
        AppError::Unavailable {
            kind: "model_unavailable",
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
