//! Error taxonomy surfaced at the facade boundary.
//!
//! Internal plumbing uses `anyhow`; the [`MemoryManager`](super::manager)
//! converts everything a caller can act on into one of these kinds. Best-effort
//! work (index writes, access bumps, LLM calls) never produces a caller-visible
//! error — it is logged and swallowed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Missing required field, illegal enum value, or malformed id.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The target fragment does not exist under the caller's scope.
    #[error("not found: {0}")]
    NotFound(String),

    /// Deleting a permanent fragment without `force`.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The durable store is unavailable or a query failed.
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),

    /// Embedding or LLM provider exceeded its bound.
    #[error("provider timeout: {0}")]
    Timeout(String),
}

impl MemoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(anyhow::Error::new(e))
    }
}
