//! MicroVM client errors

use thiserror::Error;

/// Errors that can occur when talking to the microvm service
#[derive(Debug, Error)]
pub enum MicrovmError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service returned an error
    #[error("microvm service error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication failed (missing or wrong basic auth token)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The microvm does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// TLS material could not be loaded
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl MicrovmError {
    /// True when the service reported that the microvm does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, MicrovmError::NotFound(_))
    }
}
