//! Error types for the TallyKV engine.
//!
//! A missing or expired key is not an error: lookups return `Option` and
//! absence is a normal result.

use thiserror::Error;

/// Errors surfaced by store operations, scripts and sketches.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied argument was malformed (zero TTL, non-positive
    /// limit, unknown script name, wrong key or argument count).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A script failed part-way through. None of its writes were applied and
    /// the caller may retry.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// Storage capacity exceeded
    #[error("storage full: {current_bytes} bytes used of {max_bytes} bytes maximum")]
    StorageFull {
        /// Current storage usage in bytes
        current_bytes: usize,
        /// Maximum storage capacity in bytes
        max_bytes: usize,
    },
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn aborted(msg: impl Into<String>) -> Self {
        Error::TransactionAborted(msg.into())
    }

    /// Returns `true` if the operation can be retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransactionAborted(_))
    }

    /// Returns `true` if this error indicates the storage budget is exhausted.
    pub fn is_storage_full(&self) -> bool {
        matches!(self, Error::StorageFull { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
