//! Atomic apply with whole-pass retry.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::{Op, Transaction};
use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, Result};
use crate::store::{StoreError, TransactionRunner};

/// An operation that builds a batch from a fresh snapshot on every attempt.
#[async_trait]
pub trait ModelOperation: Send {
    /// ID of the machine the operation changes.
    fn target(&self) -> &str;

    /// Build the complete batch for this attempt (0-based).
    async fn build(&mut self, attempt: usize) -> Result<Vec<Op>>;

    /// Called once with the final outcome. The returned result is what the
    /// caller of `apply_operation` receives.
    fn done(&mut self, result: Result<ApplyOutcome>) -> Result<ApplyOutcome>;
}

/// Final outcome of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Number of build passes run.
    pub attempts: usize,
    /// Whether a batch was committed. False when nothing needed changing.
    pub applied: bool,
    /// Number of operations in the committed batch.
    pub ops: usize,
}

/// Build and apply an operation, retrying from a fresh snapshot when the
/// store rejects a batch because its preconditions no longer hold.
pub async fn apply_operation<R, O>(
    runner: &R,
    op: &mut O,
    config: &ReconcileConfig,
) -> Result<ApplyOutcome>
where
    R: TransactionRunner + ?Sized,
    O: ModelOperation + ?Sized,
{
    let result = run_attempts(runner, op, config).await;
    op.done(result)
}

async fn run_attempts<R, O>(runner: &R, op: &mut O, config: &ReconcileConfig) -> Result<ApplyOutcome>
where
    R: TransactionRunner + ?Sized,
    O: ModelOperation + ?Sized,
{
    let max_attempts = config.attempts();

    for attempt in 0..max_attempts {
        let ops = op.build(attempt).await?;

        if !ops.iter().any(Op::is_effective) {
            debug!(machine = %op.target(), attempt, "no link-layer changes required");
            return Ok(ApplyOutcome {
                attempts: attempt + 1,
                applied: false,
                ops: 0,
            });
        }

        let txn = Transaction::new(ops);
        let count = txn.ops.len();
        let txn_id = txn.id.clone();

        match submit(runner, txn, config.apply_timeout()).await {
            Ok(()) => {
                info!(
                    machine = %op.target(),
                    txn = %txn_id,
                    ops = count,
                    attempt,
                    "link-layer update applied"
                );
                return Ok(ApplyOutcome {
                    attempts: attempt + 1,
                    applied: true,
                    ops: count,
                });
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    machine = %op.target(),
                    txn = %txn_id,
                    attempt,
                    error = %e,
                    "link-layer update rejected, retrying from a fresh snapshot"
                );
            }
            Err(StoreError::NotFound(_)) => {
                return Err(ReconcileError::NotFound(op.target().to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(ReconcileError::Conflict {
        machine_id: op.target().to_string(),
        attempts: max_attempts,
    })
}

async fn submit<R>(runner: &R, txn: Transaction, timeout: Option<Duration>) -> crate::store::Result<()>
where
    R: TransactionRunner + ?Sized,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, runner.run_transaction(txn))
            .await
            .map_err(|_| StoreError::Timeout(limit))?,
        None => runner.run_transaction(txn).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runner answering each submission with the next scripted result.
    struct ScriptedRunner {
        results: Mutex<Vec<crate::store::Result<()>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(mut results: Vec<crate::store::Result<()>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TransactionRunner for ScriptedRunner {
        async fn run_transaction(&self, _txn: Transaction) -> crate::store::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    struct SlowRunner;

    #[async_trait]
    impl TransactionRunner for SlowRunner {
        async fn run_transaction(&self, _txn: Transaction) -> crate::store::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    /// Operation returning a fixed batch and recording its attempts.
    struct FixedOp {
        ops: Vec<Op>,
        attempts: Vec<usize>,
        done_calls: usize,
    }

    fn make_op(effective: bool) -> FixedOp {
        let mut ops = vec![Op::AssertMachineAlive {
            machine_id: "0".to_string(),
        }];
        if effective {
            ops.push(Op::RemoveDevice {
                id: "dev-1".to_string(),
                revision: 0,
            });
        }
        FixedOp {
            ops,
            attempts: vec![],
            done_calls: 0,
        }
    }

    #[async_trait]
    impl ModelOperation for FixedOp {
        fn target(&self) -> &str {
            "0"
        }

        async fn build(&mut self, attempt: usize) -> Result<Vec<Op>> {
            self.attempts.push(attempt);
            Ok(self.ops.clone())
        }

        fn done(&mut self, result: Result<ApplyOutcome>) -> Result<ApplyOutcome> {
            self.done_calls += 1;
            result
        }
    }

    fn aborted() -> crate::store::Result<()> {
        Err(StoreError::Aborted("machine '0' is not alive".into()))
    }

    #[tokio::test]
    async fn test_applies_first_attempt() {
        let runner = ScriptedRunner::new(vec![Ok(())]);
        let mut op = make_op(true);

        let outcome = apply_operation(&runner, &mut op, &ReconcileConfig::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome {
                attempts: 1,
                applied: true,
                ops: 2
            }
        );
        assert_eq!(op.done_calls, 1);
    }

    #[tokio::test]
    async fn test_noop_batch_not_submitted() {
        let runner = ScriptedRunner::new(vec![]);
        let mut op = make_op(false);

        let outcome = apply_operation(&runner, &mut op, &ReconcileConfig::default())
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retries_after_abort() {
        let runner = ScriptedRunner::new(vec![aborted(), Ok(())]);
        let mut op = make_op(true);

        let outcome = apply_operation(&runner, &mut op, &ReconcileConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(op.attempts, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_conflict_after_max_attempts() {
        let runner = ScriptedRunner::new(vec![aborted(), aborted(), aborted()]);
        let mut op = make_op(true);

        let result = apply_operation(&runner, &mut op, &ReconcileConfig::default()).await;
        assert!(matches!(
            result,
            Err(ReconcileError::Conflict { attempts: 3, .. })
        ));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(op.done_calls, 1);
    }

    #[tokio::test]
    async fn test_other_store_errors_are_fatal() {
        let runner = ScriptedRunner::new(vec![Err(StoreError::Internal("disk full".into()))]);
        let mut op = make_op(true);

        let result = apply_operation(&runner, &mut op, &ReconcileConfig::default()).await;
        assert!(matches!(
            result,
            Err(ReconcileError::Store(StoreError::Internal(_)))
        ));
        assert_eq!(op.attempts, vec![0]);
    }

    #[tokio::test]
    async fn test_missing_machine_is_not_found() {
        let runner = ScriptedRunner::new(vec![Err(StoreError::NotFound("machine '0'".into()))]);
        let mut op = make_op(true);

        let result = apply_operation(&runner, &mut op, &ReconcileConfig::default()).await;
        assert!(matches!(result, Err(ReconcileError::NotFound(id)) if id == "0"));
    }

    #[tokio::test]
    async fn test_apply_timeout() {
        let config = ReconcileConfig {
            max_attempts: 3,
            apply_timeout_ms: Some(20),
        };
        let mut op = make_op(true);

        let result = apply_operation(&SlowRunner, &mut op, &config).await;
        assert!(matches!(
            result,
            Err(ReconcileError::Store(StoreError::Timeout(_)))
        ));
    }
}
