//! Error types for the cloud sync crate.

use thiserror::Error;

/// Result type alias for cloud sync operations.
pub type Result<T> = std::result::Result<T, CloudSyncError>;

/// Errors that can occur while talking to the identity server.
#[derive(Debug, Error)]
pub enum CloudSyncError {
    /// Transport-level failure (DNS, connect, TLS, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The request exceeded the client deadline and was aborted.
    #[error("Request timed out")]
    Timeout,

    /// The server rejected the access token.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Application-level error reported inside the response envelope or an
    /// HTTP failure status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Response body did not match the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl CloudSyncError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<reqwest::Error> for CloudSyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<CloudSyncError> for authkeeper_core::Error {
    fn from(err: CloudSyncError) -> Self {
        match err {
            CloudSyncError::Network(message) => Self::Network(message),
            CloudSyncError::Timeout => Self::Timeout,
            CloudSyncError::Auth(message) => Self::Auth(message),
            CloudSyncError::Api { status, message } => match status {
                401 | 403 => Self::Auth(message),
                500..=599 => Self::Network(format!("API error ({status}): {message}")),
                _ => Self::Protocol(format!("API error ({status}): {message}")),
            },
            CloudSyncError::Protocol(message) => Self::Protocol(message),
        }
    }
}
