//! Error types for Keeper

use thiserror::Error;

/// Result type alias for Keeper operations
pub type Result<T> = std::result::Result<T, KeeperError>;

/// Main error type for Keeper
#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeeperError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeeperError::Unavailable(_)
                | KeeperError::Remote(_)
                | KeeperError::Http(_)
                | KeeperError::Timeout(_)
        )
    }
}
