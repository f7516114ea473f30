//! Error types for coldchain-store.

use std::path::PathBuf;

/// Result type for coldchain-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coldchain-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The database was written by a different schema version.
    #[error("Unsupported schema version {found} (expected {expected})")]
    UnsupportedSchema { found: i32, expected: i32 },

    /// Timestamp outside the representable range.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
