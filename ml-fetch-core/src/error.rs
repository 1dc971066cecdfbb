//! Error types for batch fetchers

use std::io;
use thiserror::Error;

/// Result type for fetcher operations
pub type Result<T> = std::result::Result<T, FetchError>;

/// Error type for fetcher operations
#[derive(Error, Debug)]
pub enum FetchError {
    /// Out-of-range construction or setup parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An operation needing a bound source ran before `setup`
    #[error("`{0}` should have been `setup` with a source")]
    NotConfigured(String),

    /// Iterator views were read outside an active iteration pass
    #[error("The source iterator isn't available outside an iteration pass")]
    NotIterating,

    /// No more batches remain. Expected, not a failure.
    #[error("Source exhausted")]
    Exhausted,

    /// A device transfer failed or its completion signal was lost
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// A checkpoint does not fit the bound sources
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error while persisting checkpoints
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Binary state encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON configuration error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure raised by a source collaborator, passed through as-is
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

impl FetchError {
    /// Whether this is the end-of-sequence signal rather than a failure
    pub fn is_exhausted(&self) -> bool {
        matches!(self, FetchError::Exhausted)
    }
}
