//! Reconciliation settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::Result;

/// Default number of build-and-apply passes before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Settings for `apply_operation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Passes to try before reporting a conflict. Zero is treated as one.
    pub max_attempts: usize,
    /// Upper bound for a single transaction submission, in milliseconds.
    pub apply_timeout_ms: Option<u64>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            apply_timeout_ms: None,
        }
    }
}

impl ReconcileConfig {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    pub fn apply_timeout(&self) -> Option<Duration> {
        self.apply_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReconcileConfig::default();
        assert_eq!(config.attempts(), 3);
        assert_eq!(config.apply_timeout(), None);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let config = ReconcileConfig {
            max_attempts: 0,
            apply_timeout_ms: None,
        };
        assert_eq!(config.attempts(), 1);
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, br#"{"apply_timeout_ms": 250}"#)
            .await
            .unwrap();

        let config = ReconcileConfig::load(&path).await.unwrap();
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.apply_timeout(), Some(Duration::from_millis(250)));
    }
}
