//! Error types shared across the authkeeper crates.

use thiserror::Error;

/// Result type alias using the core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in authkeeper operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Input rejected before any state mutation (bad secret, empty name).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Insertion could not find a free disambiguated name within the retry bound.
    #[error("Cannot generate a unique name for account '{name}', tried {attempts} times")]
    UniquenessExhausted { name: String, attempts: u32 },

    /// Account not found
    #[error("Account not found: {0}")]
    NotFound(i32),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Transport-level network failure; transient, eligible for retry.
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded its deadline and was aborted.
    #[error("Request timed out")]
    Timeout,

    /// The server rejected the access token; caller must re-authenticate.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Unexpected response shape from the server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Converged set violated an internal invariant; the sync pass is aborted
    /// without committing anything.
    #[error("Merge invariant violated: {0}")]
    MergeInvariant(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// True when the failure is transient and the next periodic tick may
    /// succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    /// True when the failure means the cached session is no longer usable.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}
