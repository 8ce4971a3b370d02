//! Cache-related error types

use thiserror::Error;

/// Cache operation errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Unknown cache category: {name}")]
    UnknownCategory { name: String },

    #[error("Invalid policy for category {category}: {message}")]
    InvalidPolicy { category: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Storage error ({engine}): {message}")]
    Storage {
        engine: &'static str,
        message: String,
    },

    #[error("Storage quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Blocking task failed: {message}")]
    Join { message: String },
}

impl CacheError {
    /// Whether this error is the fallback engine running out of room
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, CacheError::QuotaExceeded { .. })
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Join {
            message: err.to_string(),
        }
    }
}

/// Re-export commonly used Result type
pub type Result<T> = std::result::Result<T, CacheError>;
