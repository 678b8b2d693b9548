use crate::services::{admission::AdmissionError, object_store::StoreError};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Error returned by every HTTP handler.
///
/// `code` is a stable machine-readable reason so clients can tell
/// "retry later" from "gone" from "fix your input".
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, reason code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error. The detail is logged, not
    /// returned.
    pub fn internal(detail: impl fmt::Display) -> Self {
        tracing::error!("internal error: {}", detail);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "Internal server error",
        )
    }

    /// Absent, expired, consumed and never-existed all look the same.
    pub fn not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "File not found or expired",
        )
    }

    pub fn bad_request(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, msg)
    }

    pub fn rate_limited() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Too many requests",
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BlobTooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", "File too large")
            }
            StoreError::Interrupted(err) => {
                AppError::bad_request("invalid_request", format!("upload interrupted: {}", err))
            }
            other => AppError::internal(other),
        }
    }
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::InvalidDuration(_) => AppError::bad_request(
                "invalid_duration",
                "Invalid expiresIn. Use a duration like 30m, 24h, 7d",
            ),
            AdmissionError::TtlTooLong { .. } => AppError::bad_request(
                "ttl_too_long",
                "expiresIn exceeds maximum allowed TTL",
            ),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        let status = err.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::new(status, "payload_too_large", "File too large")
        } else {
            AppError::new(status, "invalid_request", err.body_text())
        }
    }
}
