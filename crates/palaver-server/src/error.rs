use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use palaver_protocol::ErrorKind;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    BadState(String),

    #[error("Invalid input: {0}")]
    BadInput(String),

    #[error("Voice session failed")]
    SessionFailed,

    #[error("Transient failure: {0}")]
    Transient(#[from] anyhow::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),
}

impl AppError {
    /// The wire-level error kind reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Unauthorized | AppError::Jwt(_) => ErrorKind::Unauthorized,
            AppError::Forbidden(_) => ErrorKind::Forbidden,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::BadState(_) => ErrorKind::BadState,
            AppError::BadInput(_) => ErrorKind::BadInput,
            AppError::SessionFailed => ErrorKind::SessionFailed,
            AppError::Transient(_) | AppError::Rtc(_) => ErrorKind::Transient,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::BadState(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::BadInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::SessionFailed => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Transient(e) => {
                tracing::error!("Transient error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Rtc(e) => {
                tracing::error!("WebRTC error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Media stack error".to_string(),
                )
            }
            AppError::Jwt(_) => (StatusCode::UNAUTHORIZED, "Invalid token".to_string()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
