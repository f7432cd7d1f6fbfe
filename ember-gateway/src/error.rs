//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ember_executor::{ErrorKind, SandboxError};
use serde_json::json;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error from the sandbox lifecycle.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The request body could not be decoded.
    #[error("malformed request body: {0}")]
    MalformedBody(String),
}

impl GatewayError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sandbox(e) => e.kind(),
            Self::MalformedBody(_) => ErrorKind::InvalidArgument,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = match kind {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Details go to the log only.
        if kind == ErrorKind::Internal {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::info!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": kind.as_str() }))).into_response()
    }
}
