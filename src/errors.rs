use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::transfer_service::TransferError;

/// An HTTP-facing error: status, a stable machine-readable code and a
/// message that is safe to show to the caller.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_input", msg)
    }

    /// Shortcut for 401 when no identity accompanies the request
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", msg)
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

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        let (status, code) = match &err {
            TransferError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            TransferError::PayloadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large")
            }
            TransferError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            TransferError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            TransferError::Expired => (StatusCode::GONE, "expired"),
            TransferError::PasswordRequired => (StatusCode::UNAUTHORIZED, "password_required"),
            TransferError::InvalidCredential => (StatusCode::UNAUTHORIZED, "invalid_credential"),
            TransferError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
        };
        AppError::new(status, code, err.to_string())
    }
}
