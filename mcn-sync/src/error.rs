//! Error types for mcn-sync
//!
//! None of these are fatal: fetch failures fall back to cached and local
//! data, launch failures release the pending slot, observer failures only
//! mean no record was written.

use thiserror::Error;

/// Remote dataset fetch errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure or non-success HTTP status
    #[error("Network error: {0}")]
    Network(String),

    /// Body is not a JSON object of strings
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Secondary context could not be opened
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn harvest context: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Invalid harvest target: {0}")]
    InvalidTarget(String),
}

/// Extraction observer errors
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("Invalid profile URL: {0}")]
    InvalidUrl(String),

    #[error("Profile page unavailable: {0}")]
    Page(String),

    #[error(transparent)]
    Store(#[from] mcn_common::Error),
}
