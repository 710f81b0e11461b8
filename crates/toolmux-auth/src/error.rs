//! Error types for token cache operations.

use thiserror::Error;

/// Errors that can occur while reading or writing cached tokens.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Failed to read or write the token file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize token data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server names are used as keys and must not be empty.
    #[error("Invalid server name: '{0}'")]
    InvalidKey(String),

    /// Could not determine the data directory.
    #[error("Could not determine data directory")]
    NoDataDir,

    /// Failed to set file permissions.
    #[error("Failed to set file permissions: {0}")]
    Permissions(String),

    /// Lock was poisoned (another thread panicked while holding the lock).
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result type for token cache operations.
pub type AuthResult<T> = Result<T, AuthError>;
