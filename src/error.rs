use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Control socket error: {0}")]
    ControlSocket(String),

    #[error("Emulator error: {0}")]
    Emulator(String),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Encoder error [{codec}]: {reason}")]
    EncoderError { codec: String, reason: String },

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(error_message = %body.message, "Request failed");

        (StatusCode::OK, Json(body)).into_response()
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, AppError>;
