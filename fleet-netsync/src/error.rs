//! Reconciliation error types.

use thiserror::Error;

use crate::store::StoreError;

/// Errors that end a reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading the snapshot or applying the batch failed.
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Every attempt was rejected by a failed precondition.
    #[error("link-layer update for machine '{machine_id}' conflicted {attempts} times")]
    Conflict { machine_id: String, attempts: usize },

    /// The incoming topology is malformed or contradicts the snapshot.
    #[error("invalid {record}: {reason}")]
    Build { record: String, reason: String },

    /// The machine no longer exists.
    #[error("machine '{0}' not found")]
    NotFound(String),

    /// The machine exists but is dying or dead.
    #[error("machine '{0}' is not alive")]
    NotAlive(String),
}

impl ReconcileError {
    pub fn build(record: impl Into<String>, reason: impl Into<String>) -> Self {
        ReconcileError::Build {
            record: record.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;
