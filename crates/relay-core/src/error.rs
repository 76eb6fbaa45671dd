//! Error types shared across the store, cache and orchestration layers.

use std::time::Duration;

use thiserror::Error;

/// Failures of the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The event id is already stored; nothing was written.
    #[error("duplicate: already have this event")]
    Duplicate,
    /// A constraint other than id uniqueness was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to encode event: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate)
    }
}

/// Failures of a result cache. Always non-fatal to the caller.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache call timed out after {0:?}")]
    Timeout(Duration),
}
