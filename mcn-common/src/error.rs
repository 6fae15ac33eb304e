//! Common error types for MCN sync

use thiserror::Error;

/// Common result type for MCN sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across MCN sync crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored or exported JSON could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A multi-key write stopped after some keys were written
    #[error("Partial write: {0}")]
    PartialWrite(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
