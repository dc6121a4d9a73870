//! Store error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A transaction precondition did not hold; nothing was applied.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// Version mismatch (optimistic concurrency control).
    #[error("version mismatch on {id}: expected {expected}, got {actual}")]
    VersionMismatch {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Conflict with existing resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store did not answer in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Reading or writing the backing file failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Backing file could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the failed transaction may succeed when rebuilt from a fresh
    /// snapshot.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Aborted(_) | StoreError::VersionMismatch { .. }
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(StoreError::Aborted("machine not alive".into()).is_retryable());
        assert!(
            StoreError::VersionMismatch {
                id: "dev-1".into(),
                expected: 1,
                actual: 2
            }
            .is_retryable()
        );
        assert!(!StoreError::NotFound("machine '0'".into()).is_retryable());
        assert!(!StoreError::Conflict("provider ID in use".into()).is_retryable());
        assert!(!StoreError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
