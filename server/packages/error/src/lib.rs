use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Request-boundary errors surfaced to HTTP clients.
///
/// Subprocess-side failures (launch errors, stderr output, non-zero exits)
/// never appear here; those are translated into SSE events on the stream
/// that owns the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration not found")]
    ConfigNotFound,
    #[error("No active connections found for this configuration")]
    NoActiveConnections,
    #[error("Failed to send prompt to any active connections")]
    PromptDeliveryFailed,
    #[error("{message}")]
    InvalidRequest { message: String },
    #[error("{message}")]
    Storage { message: String },
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 404,
            Self::NoActiveConnections => 404,
            Self::PromptDeliveryFailed => 500,
            Self::InvalidRequest { .. } => 400,
            Self::Storage { .. } => 500,
        }
    }
}

/// JSON body for every error response: `{"error": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        Self::new(err.to_string())
    }
}
