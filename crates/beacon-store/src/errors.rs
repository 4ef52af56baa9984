//! Error types for the notification store.

use thiserror::Error;

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` error, including trigger aborts.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON encode/decode error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Which migration failed and why.
        message: String,
    },

    /// The create contract was violated.
    #[error("invalid notification: {0}")]
    InvalidNotification(String),

    /// The blocking task running the query panicked or was cancelled.
    #[error("store task failed: {0}")]
    Join(String),
}

/// Convenience alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;
