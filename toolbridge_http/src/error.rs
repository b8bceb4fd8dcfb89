//! Error types for the HTTP bridge

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use toolbridge_common::message::{codes, error_envelope};

/// Every way a bridged call can fail.
///
/// The type is `Clone` so that one initialization outcome can be handed to
/// every caller that waited on it; foreign errors are kept as strings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Failed to spawn provider '{provider}': {reason}")]
    Spawn { provider: String, reason: String },

    #[error("Provider '{provider}' did not answer initialize within {timeout_secs}s")]
    InitTimeout { provider: String, timeout_secs: u64 },

    #[error("Provider '{provider}' did not answer {method} within {timeout_secs}s")]
    CallTimeout {
        provider: String,
        method: String,
        timeout_secs: u64,
    },

    #[error("Provider '{provider}' returned error {code}: {message}")]
    Protocol {
        provider: String,
        code: i64,
        message: String,
    },

    #[error("Provider '{provider}' exited: {reason}")]
    ProcessExited { provider: String, reason: String },

    #[error("Provider '{provider}' is not ready")]
    NotReady { provider: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP server error: {0}")]
    HttpServer(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Json(e.to_string())
    }
}

impl BridgeError {
    /// HTTP status used when this error reaches a caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::UnknownProvider(_) | BridgeError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            BridgeError::InitTimeout { .. } | BridgeError::CallTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            BridgeError::Spawn { .. }
            | BridgeError::ProcessExited { .. }
            | BridgeError::Protocol { .. }
            | BridgeError::Communication(_) => StatusCode::BAD_GATEWAY,
            BridgeError::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Io(_)
            | BridgeError::Json(_)
            | BridgeError::Config(_)
            | BridgeError::HttpServer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error code placed in the error envelope.
    pub fn rpc_code(&self) -> i64 {
        match self {
            BridgeError::UnknownProvider(_) => codes::UNKNOWN_PROVIDER,
            BridgeError::InvalidRequest(_) => codes::INVALID_REQUEST,
            BridgeError::InitTimeout { .. } | BridgeError::CallTimeout { .. } => codes::TIMEOUT,
            BridgeError::Spawn { .. }
            | BridgeError::ProcessExited { .. }
            | BridgeError::NotReady { .. } => codes::PROVIDER_UNAVAILABLE,
            BridgeError::Protocol { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let body = error_envelope(self.rpc_code(), &self.to_string());
        (self.status_code(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
