//! Error types for the control API
//!
//! All errors implement `IntoResponse` for Axum handlers and render as
//! `{"code": ..., "error": ...}`.

use crate::reconciler::{ReconcileError, RpcCode};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read configuration file '{path}': {source}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    ConfigParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl AppError {
    /// Caller-facing status code
    pub fn code(&self) -> RpcCode {
        match self {
            Self::Validation(_) => RpcCode::InvalidArgument,
            Self::Reconcile(e) => e.code(),
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParseFailed { .. }
            | Self::ConfigValidationFailed { .. } => RpcCode::Internal,
        }
    }
}

impl RpcCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let body = Json(serde_json::json!({
            "code": code.as_str(),
            "error": self.to_string(),
        }));

        (code.http_status(), body).into_response()
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, AppError>;
