//! Retryable transaction executor with isolation-level presets.
//!
//! One logical operation walks `Attempting -> {Succeeded | ClassifyError}`,
//! and on a retryable classification `Waiting -> Attempting` again until the
//! policy's budget runs out. A failure to open the transaction is a setup
//! error and never retried; cancellation aborts the backoff wait immediately.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, TransientKind};
use crate::retry::{RetryPolicy, RetryStats};
use crate::store::{Store, StoreTx};

/// Transaction body: runs inside one attempt, against one open transaction.
/// Called once per attempt, so it must be safe to re-run.
pub type TxnFn = dyn for<'a> Fn(&'a mut dyn StoreTx) -> BoxFuture<'a, Result<(), StoreError>>
    + Send
    + Sync;

/// Shim that pins down the higher-ranked closure type at the call site.
pub fn txn_fn<F>(f: F) -> F
where
    F: for<'a> Fn(&'a mut dyn StoreTx) -> BoxFuture<'a, Result<(), StoreError>> + Send + Sync,
{
    f
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Per-operation transaction configuration. The named presets pair an
/// isolation level and timeout with the matching [RetryPolicy].
#[derive(Clone, Debug)]
pub struct TxnConfig {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    /// Deadline for one attempt, not for the whole retry loop.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl TxnConfig {
    pub fn read_only() -> Self {
        Self {
            isolation: None,
            read_only: true,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::read_only(),
        }
    }

    pub fn read_write() -> Self {
        Self {
            isolation: None,
            read_only: false,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::read_write(),
        }
    }

    pub fn critical() -> Self {
        Self {
            isolation: Some(IsolationLevel::Serializable),
            read_only: false,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::critical(),
        }
    }

    pub fn batch() -> Self {
        Self {
            isolation: None,
            read_only: false,
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::batch(),
        }
    }

    pub fn reporting() -> Self {
        Self {
            isolation: Some(IsolationLevel::RepeatableRead),
            read_only: true,
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::reporting(),
        }
    }
}

/// Terminal outcome of a retryable transaction call.
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("operation '{operation}' could not open a transaction: {source}")]
    Setup {
        operation: String,
        #[source]
        source: StoreError,
    },
    #[error("operation '{operation}' failed on attempt {attempt} (not retryable): {source}")]
    Aborted {
        operation: String,
        attempt: u32,
        #[source]
        source: StoreError,
    },
    #[error("operation '{operation}' exhausted {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("operation '{operation}' cancelled after {attempts} attempt(s)")]
    Cancelled { operation: String, attempts: u32 },
}

enum AttemptFailure {
    Begin(StoreError),
    Run(StoreError),
}

/// Executes transaction bodies against one store under a [TxnConfig].
#[derive(Clone)]
pub struct TxnExecutor {
    store: Arc<dyn Store>,
}

impl TxnExecutor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Runs `f` in a transaction with retry per `config`, discarding stats.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        config: &TxnConfig,
        f: &TxnFn,
    ) -> Result<(), TxnError> {
        self.execute_with_stats(cancel, operation, config, f).await.1
    }

    /// Standard read-write transaction, named after the calling operation.
    pub async fn execute_standard(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        f: &TxnFn,
    ) -> Result<(), TxnError> {
        self.execute(cancel, operation, &TxnConfig::read_write(), f)
            .await
    }

    /// Serializable transaction with aggressive retry; returns stats for
    /// callers that record them.
    pub async fn execute_critical(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        f: &TxnFn,
    ) -> (RetryStats, Result<(), TxnError>) {
        self.execute_with_stats(cancel, operation, &TxnConfig::critical(), f)
            .await
    }

    /// Backfill batch transaction; the operation name carries the batch label
    /// and size so log lines identify the unit of work.
    pub async fn execute_batch(
        &self,
        cancel: &CancellationToken,
        batch_name: &str,
        batch_size: usize,
        f: &TxnFn,
    ) -> Result<(), TxnError> {
        let operation = format!("batch_{batch_name}_size_{batch_size}");
        self.execute(cancel, &operation, &TxnConfig::batch(), f).await
    }

    /// Full contract: the retry loop described in the module docs, returning
    /// per-operation stats alongside the outcome.
    pub async fn execute_with_stats(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        config: &TxnConfig,
        f: &TxnFn,
    ) -> (RetryStats, Result<(), TxnError>) {
        let started = Instant::now();
        let mut stats = RetryStats::for_operation(operation);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                // No attempt was started this iteration; keep the counter at
                // the number of attempts actually made.
                stats.total_attempts = attempt;
                stats.total_duration = started.elapsed();
                return (
                    stats,
                    Err(TxnError::Cancelled {
                        operation: operation.to_string(),
                        attempts: attempt,
                    }),
                );
            }

            stats.total_attempts = attempt + 1;

            let outcome = match tokio::time::timeout(config.timeout, self.run_attempt(config, f))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(AttemptFailure::Run(StoreError::transient(
                    TransientKind::StatementTimeout,
                    format!("attempt deadline of {:?} expired", config.timeout),
                ))),
            };

            let err = match outcome {
                Ok(()) => {
                    stats.successful_retry = attempt > 0;
                    stats.total_duration = started.elapsed();
                    if attempt > 0 {
                        tracing::info!(
                            operation,
                            attempts = attempt + 1,
                            elapsed_ms = stats.total_duration.as_millis() as u64,
                            "transaction succeeded after retry"
                        );
                    }
                    return (stats, Ok(()));
                }
                Err(AttemptFailure::Begin(err)) => {
                    stats.error_codes.push(err.code().to_string());
                    stats.total_duration = started.elapsed();
                    tracing::error!(operation, error = %err, "failed to open transaction");
                    return (
                        stats,
                        Err(TxnError::Setup {
                            operation: operation.to_string(),
                            source: err,
                        }),
                    );
                }
                Err(AttemptFailure::Run(err)) => err,
            };

            stats.error_codes.push(err.code().to_string());

            if !config.retry.is_retryable(&err) {
                stats.total_duration = started.elapsed();
                tracing::warn!(operation, attempt = attempt + 1, code = err.code(), error = %err,
                    "non-retryable store error");
                return (
                    stats,
                    Err(TxnError::Aborted {
                        operation: operation.to_string(),
                        attempt: attempt + 1,
                        source: err,
                    }),
                );
            }

            if attempt >= config.retry.max_retries {
                stats.total_duration = started.elapsed();
                tracing::error!(operation, attempts = attempt + 1, code = err.code(),
                    "retry budget exhausted");
                return (
                    stats,
                    Err(TxnError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    }),
                );
            }

            let delay = config.retry.backoff_delay(attempt);
            tracing::warn!(operation, attempt = attempt + 1, code = err.code(),
                delay_ms = delay.as_millis() as u64, "retryable store error, backing off");

            tokio::select! {
                _ = cancel.cancelled() => {
                    stats.total_duration = started.elapsed();
                    return (
                        stats,
                        Err(TxnError::Cancelled {
                            operation: operation.to_string(),
                            attempts: attempt + 1,
                        }),
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    async fn run_attempt(&self, config: &TxnConfig, f: &TxnFn) -> Result<(), AttemptFailure> {
        let mut tx = self.store.begin().await.map_err(AttemptFailure::Begin)?;

        // Isolation must be the first statement in the transaction.
        if let Some(level) = config.isolation {
            let stmt = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            if let Err(err) = tx.execute(&stmt, &[]).await {
                let _ = tx.rollback().await;
                return Err(AttemptFailure::Run(err));
            }
        }
        if config.read_only {
            if let Err(err) = tx.execute("SET TRANSACTION READ ONLY", &[]).await {
                let _ = tx.rollback().await;
                return Err(AttemptFailure::Run(err));
            }
        }

        match f(&mut *tx).await {
            Ok(()) => tx.commit().await.map_err(AttemptFailure::Run),
            Err(err) => {
                let _ = tx.rollback().await;
                Err(AttemptFailure::Run(err))
            }
        }
    }
}
