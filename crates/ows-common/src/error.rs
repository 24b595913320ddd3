//! Error types for the OWS services.

use thiserror::Error;

/// Result type alias using OwsError.
pub type OwsResult<T> = Result<T, OwsError>;

/// Primary error type for OWS operations.
#[derive(Debug, Error)]
pub enum OwsError {
    // === Request errors ===
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid value for parameter '{param}': {message}")]
    InvalidParameter { param: String, message: String },

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Style not found: {0}")]
    StyleNotFound(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Invalid CRS: {0}")]
    InvalidCrs(String),

    #[error("The requested area is too large. Please try with a smaller one.")]
    AreaTooLarge,

    #[error("Invalid dataset namespace: {0}")]
    UnknownNamespace(String),

    // === Upstream errors ===
    #[error("Index query failed: {0}")]
    IndexError(String),

    #[error("Worker request failed: {0}")]
    WorkerError(String),

    #[error("Peer frontend request failed: {0}")]
    PeerError(String),

    // === Encoding errors ===
    #[error("Raster encoding failed: {0}")]
    EncodeError(String),

    #[error("Rendering failed: {0}")]
    RenderError(String),

    // === Infrastructure errors ===
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0} request timed out")]
    Timeout(&'static str),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl OwsError {
    /// HTTP status code for this error. Error bodies are always plain text.
    pub fn http_status(&self) -> u16 {
        match self {
            OwsError::MissingParameter(_)
            | OwsError::InvalidParameter { .. }
            | OwsError::LayerNotFound(_)
            | OwsError::StyleNotFound(_)
            | OwsError::ProcessNotFound(_)
            | OwsError::InvalidCrs(_)
            | OwsError::AreaTooLarge => 400,

            OwsError::UnknownNamespace(_) => 404,

            OwsError::IndexError(_)
            | OwsError::WorkerError(_)
            | OwsError::PeerError(_)
            | OwsError::EncodeError(_)
            | OwsError::RenderError(_)
            | OwsError::ConfigError(_)
            | OwsError::Timeout(_)
            | OwsError::Cancelled(_)
            | OwsError::Internal(_) => 500,
        }
    }

    /// Shorthand for a malformed-parameter error.
    pub fn invalid(param: &str, message: impl Into<String>) -> Self {
        OwsError::InvalidParameter {
            param: param.to_string(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for OwsError {
    fn from(err: std::io::Error) -> Self {
        OwsError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for OwsError {
    fn from(err: serde_json::Error) -> Self {
        OwsError::Internal(format!("JSON error: {}", err))
    }
}
