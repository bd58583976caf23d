//! Storage-level error type, folded into the core error at the crate
//! boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database query error: {0}")]
    Diesel(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Database connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Write actor unavailable: {0}")]
    WriterGone(String),

    /// A domain error surfaced inside a storage transaction; passed through
    /// unchanged so callers see the original variant.
    #[error(transparent)]
    Domain(authkeeper_core::Error),
}

impl From<authkeeper_core::Error> for StorageError {
    fn from(err: authkeeper_core::Error) -> Self {
        Self::Domain(err)
    }
}

impl From<StorageError> for authkeeper_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Domain(inner) => inner,
            other => Self::Database(other.to_string()),
        }
    }
}
