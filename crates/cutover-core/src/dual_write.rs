//! Best-effort dual-write transaction coordination.
//!
//! Two independent transactions, never a distributed commit: the legacy
//! (primary) store remains the store of record for the whole migration
//! window. A secondary that cannot even open a transaction fails the call
//! (fail-closed on setup), but a secondary commit failure after the primary
//! committed is downgraded to logged drift — the backfill controller or an
//! out-of-band reconciliation job is the correctness backstop.
//!
//! Transient failures before anything has committed (body errors, primary
//! commit failures) leave both stores untouched, so the whole
//! begin/run/commit sequence is re-run under a [RetryPolicy]. Setup failures
//! are never retried, and nothing is retried once the primary has committed.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::store::{Store, StoreTx};

/// Shim that pins down the higher-ranked closure type at the call site.
/// The closure runs once per attempt, so it must be safe to re-run.
pub fn dual_write_fn<F>(f: F) -> F
where
    F: for<'a> Fn(
            &'a mut dyn StoreTx,
            Option<&'a mut dyn StoreTx>,
        ) -> BoxFuture<'a, Result<(), StoreError>>
        + Send
        + Sync,
{
    f
}

enum AttemptFailure {
    /// A transaction could not be opened; never retried.
    Setup(StoreError),
    /// Failure with both stores rolled back; retry-eligible.
    Run(StoreError),
}

pub struct DualWriteCoordinator {
    primary: Arc<dyn Store>,
    secondary: Arc<dyn Store>,
    dual_write_enabled: bool,
    retry: RetryPolicy,
}

impl DualWriteCoordinator {
    pub fn new(
        primary: Arc<dyn Store>,
        secondary: Arc<dyn Store>,
        dual_write_enabled: bool,
    ) -> Self {
        Self {
            primary,
            secondary,
            dual_write_enabled,
            retry: RetryPolicy::read_write(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dual_write_enabled(&self) -> bool {
        self.dual_write_enabled
    }

    /// Runs `f` with a primary transaction and, when dual-write is enabled,
    /// an independent secondary transaction. The secondary handle is `None`
    /// when dual-write is off; callers must treat it as optional.
    ///
    /// Commit order is primary first. A primary commit failure fails the
    /// attempt; a secondary commit failure does not. Attempts that leave
    /// both stores rolled back are retried per the coordinator's policy,
    /// with cancellation aborting the backoff wait.
    pub async fn execute_in_transaction<F>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        f: F,
    ) -> Result<(), StoreError>
    where
        F: for<'a> Fn(
                &'a mut dyn StoreTx,
                Option<&'a mut dyn StoreTx>,
            ) -> BoxFuture<'a, Result<(), StoreError>>
            + Send
            + Sync,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.run_attempt(operation, &f).await {
                Ok(()) => return Ok(()),
                Err(AttemptFailure::Setup(err)) => return Err(err),
                Err(AttemptFailure::Run(err)) => err,
            };

            if !self.retry.is_retryable(&err) || attempt >= self.retry.max_retries {
                return Err(err);
            }

            let delay = self.retry.backoff_delay(attempt);
            tracing::warn!(operation, attempt = attempt + 1, code = err.code(),
                delay_ms = delay.as_millis() as u64,
                "retryable dual-write error, backing off");

            tokio::select! {
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    async fn run_attempt<F>(&self, operation: &str, f: &F) -> Result<(), AttemptFailure>
    where
        F: for<'a> Fn(
                &'a mut dyn StoreTx,
                Option<&'a mut dyn StoreTx>,
            ) -> BoxFuture<'a, Result<(), StoreError>>
            + Send
            + Sync,
    {
        let mut primary_tx = self.primary.begin().await.map_err(AttemptFailure::Setup)?;

        let mut secondary_tx = if self.dual_write_enabled {
            match self.secondary.begin().await {
                Ok(tx) => Some(tx),
                Err(err) => {
                    // Fail-closed on setup: no write proceeds anywhere.
                    if let Err(rb) = primary_tx.rollback().await {
                        tracing::debug!(operation, error = %rb, "primary rollback failed");
                    }
                    tracing::error!(operation, error = %err,
                        "could not open secondary transaction");
                    return Err(AttemptFailure::Setup(err));
                }
            }
        } else {
            None
        };

        let secondary_handle = secondary_tx
            .as_mut()
            .map(|tx| &mut **tx as &mut dyn StoreTx);
        if let Err(err) = f(&mut *primary_tx, secondary_handle).await {
            if let Err(rb) = primary_tx.rollback().await {
                tracing::debug!(operation, error = %rb, "primary rollback failed");
            }
            if let Some(tx) = secondary_tx {
                if let Err(rb) = tx.rollback().await {
                    tracing::debug!(operation, error = %rb, "secondary rollback failed");
                }
            }
            return Err(AttemptFailure::Run(err));
        }

        if let Err(err) = primary_tx.commit().await {
            // The store of record did not persist; the attempt failed with
            // nothing committed.
            if let Some(tx) = secondary_tx {
                if let Err(rb) = tx.rollback().await {
                    tracing::debug!(operation, error = %rb, "secondary rollback failed");
                }
            }
            return Err(AttemptFailure::Run(err));
        }

        if let Some(tx) = secondary_tx {
            if let Err(err) = tx.commit().await {
                // Deliberate asymmetry: the request already succeeded against
                // the authoritative store. Record the drift and move on.
                tracing::warn!(operation, error = %err,
                    "secondary commit failed after primary commit; target store has drifted");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::TransientKind;
    use crate::store::{PoolMetrics, Row, Value};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum TxEvent {
        Began,
        Executed,
        Committed,
        RolledBack,
    }

    /// Store double that journals transaction lifecycle events.
    #[derive(Clone, Default)]
    struct JournalStore {
        events: Arc<Mutex<Vec<TxEvent>>>,
        fail_begin: bool,
        fail_commit: bool,
        transient_commit_failures: Arc<Mutex<u32>>,
    }

    impl JournalStore {
        fn with_transient_commit_failures(count: u32) -> Self {
            Self {
                transient_commit_failures: Arc::new(Mutex::new(count)),
                ..Self::default()
            }
        }

        fn events(&self) -> Vec<TxEvent> {
            self.events.lock().expect("events lock").clone()
        }

        fn record(&self, event: TxEvent) {
            self.events.lock().expect("events lock").push(event);
        }
    }

    struct JournalTx {
        store: JournalStore,
    }

    #[async_trait]
    impl Store for JournalStore {
        async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
            if self.fail_begin {
                return Err(StoreError::Unavailable("begin refused".into()));
            }
            self.record(TxEvent::Began);
            Ok(Box::new(JournalTx {
                store: self.clone(),
            }))
        }

        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, StoreError> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        fn pool_metrics(&self) -> PoolMetrics {
            PoolMetrics::default()
        }
    }

    #[async_trait]
    impl StoreTx for JournalTx {
        async fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64, StoreError> {
            self.store.record(TxEvent::Executed);
            Ok(1)
        }

        async fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, StoreError> {
            Ok(Vec::new())
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            if self.store.fail_commit {
                return Err(StoreError::Other("commit refused".into()));
            }
            {
                let mut remaining = self
                    .store
                    .transient_commit_failures
                    .lock()
                    .expect("failures lock");
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::transient(
                        TransientKind::Deadlock,
                        "deadlock on commit",
                    ));
                }
            }
            self.store.record(TxEvent::Committed);
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.store.record(TxEvent::RolledBack);
            Ok(())
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_enabled: false,
            ..RetryPolicy::read_write()
        }
    }

    fn write_both() -> impl for<'a> Fn(
        &'a mut dyn StoreTx,
        Option<&'a mut dyn StoreTx>,
    ) -> BoxFuture<'a, Result<(), StoreError>>
           + Send
           + Sync {
        dual_write_fn(|primary, secondary| {
            Box::pin(async move {
                primary.execute("INSERT INTO t VALUES ($1)", &[]).await?;
                if let Some(secondary) = secondary {
                    secondary.execute("INSERT INTO t VALUES ($1)", &[]).await?;
                }
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn commits_primary_then_secondary_on_success() {
        let primary = JournalStore::default();
        let secondary = JournalStore::default();
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            true,
        );

        coordinator
            .execute_in_transaction(&CancellationToken::new(), "create_user", write_both())
            .await
            .expect("dual write succeeds");

        assert_eq!(
            primary.events(),
            vec![TxEvent::Began, TxEvent::Executed, TxEvent::Committed]
        );
        assert_eq!(
            secondary.events(),
            vec![TxEvent::Began, TxEvent::Executed, TxEvent::Committed]
        );
    }

    #[tokio::test]
    async fn disabled_dual_write_passes_no_secondary_handle() {
        let primary = JournalStore::default();
        let secondary = JournalStore::default();
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            false,
        );

        coordinator
            .execute_in_transaction(
                &CancellationToken::new(),
                "create_user",
                dual_write_fn(|primary, secondary| {
                    Box::pin(async move {
                        assert!(secondary.is_none());
                        primary.execute("INSERT INTO t VALUES ($1)", &[]).await?;
                        Ok(())
                    })
                }),
            )
            .await
            .expect("single-store write succeeds");

        assert_eq!(
            primary.events(),
            vec![TxEvent::Began, TxEvent::Executed, TxEvent::Committed]
        );
        assert!(secondary.events().is_empty());
    }

    #[tokio::test]
    async fn secondary_begin_failure_rolls_back_primary_without_retry() {
        let primary = JournalStore::default();
        let secondary = JournalStore {
            fail_begin: true,
            ..JournalStore::default()
        };
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            true,
        )
        .with_retry_policy(fast_retry(5));

        let err = coordinator
            .execute_in_transaction(&CancellationToken::new(), "create_user", write_both())
            .await
            .expect_err("setup must fail closed");

        assert!(matches!(err, StoreError::Unavailable(_)));
        // Setup failures take exactly one attempt.
        assert_eq!(primary.events(), vec![TxEvent::Began, TxEvent::RolledBack]);
        assert!(secondary.events().is_empty());
    }

    #[tokio::test]
    async fn non_retryable_body_error_rolls_back_both_and_is_returned_unchanged() {
        let primary = JournalStore::default();
        let secondary = JournalStore::default();
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            true,
        )
        .with_retry_policy(fast_retry(5));

        let err = coordinator
            .execute_in_transaction(
                &CancellationToken::new(),
                "create_user",
                dual_write_fn(|_primary, _secondary| {
                    Box::pin(async move { Err(StoreError::Constraint("duplicate key".into())) })
                }),
            )
            .await
            .expect_err("body error surfaces");

        assert!(matches!(err, StoreError::Constraint(_)));
        // Non-retryable errors take exactly one attempt.
        assert_eq!(primary.events(), vec![TxEvent::Began, TxEvent::RolledBack]);
        assert_eq!(
            secondary.events(),
            vec![TxEvent::Began, TxEvent::RolledBack]
        );
    }

    #[tokio::test]
    async fn transient_body_error_is_retried_to_success() {
        let primary = JournalStore::default();
        let secondary = JournalStore::default();
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            true,
        )
        .with_retry_policy(fast_retry(3));

        let failures_left = Arc::new(Mutex::new(1u32));
        coordinator
            .execute_in_transaction(
                &CancellationToken::new(),
                "create_user",
                dual_write_fn(move |primary, secondary| {
                    let failures_left = failures_left.clone();
                    Box::pin(async move {
                        {
                            let mut left = failures_left.lock().expect("failures lock");
                            if *left > 0 {
                                *left -= 1;
                                return Err(StoreError::transient(
                                    TransientKind::Deadlock,
                                    "deadlock detected",
                                ));
                            }
                        }
                        primary.execute("INSERT INTO t VALUES ($1)", &[]).await?;
                        if let Some(secondary) = secondary {
                            secondary.execute("INSERT INTO t VALUES ($1)", &[]).await?;
                        }
                        Ok(())
                    })
                }),
            )
            .await
            .expect("transient body error resolves on retry");

        // First attempt rolled back both sides, second attempt committed.
        assert_eq!(
            primary.events(),
            vec![
                TxEvent::Began,
                TxEvent::RolledBack,
                TxEvent::Began,
                TxEvent::Executed,
                TxEvent::Committed,
            ]
        );
        assert_eq!(
            secondary.events(),
            vec![
                TxEvent::Began,
                TxEvent::RolledBack,
                TxEvent::Began,
                TxEvent::Executed,
                TxEvent::Committed,
            ]
        );
    }

    #[tokio::test]
    async fn transient_primary_commit_failure_is_retried_to_success() {
        let primary = JournalStore::with_transient_commit_failures(1);
        let secondary = JournalStore::default();
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            true,
        )
        .with_retry_policy(fast_retry(3));

        coordinator
            .execute_in_transaction(&CancellationToken::new(), "create_user", write_both())
            .await
            .expect("transient commit failure resolves on retry");

        // Nothing was committed on the first attempt, so the re-run is safe.
        assert_eq!(
            primary.events(),
            vec![
                TxEvent::Began,
                TxEvent::Executed,
                TxEvent::Began,
                TxEvent::Executed,
                TxEvent::Committed,
            ]
        );
        assert_eq!(
            secondary.events(),
            vec![
                TxEvent::Began,
                TxEvent::Executed,
                TxEvent::RolledBack,
                TxEvent::Began,
                TxEvent::Executed,
                TxEvent::Committed,
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_transient_error() {
        let primary = JournalStore::with_transient_commit_failures(10);
        let secondary = JournalStore::default();
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            true,
        )
        .with_retry_policy(fast_retry(2));

        let err = coordinator
            .execute_in_transaction(&CancellationToken::new(), "create_user", write_both())
            .await
            .expect_err("budget runs out");

        assert_eq!(err.transient_kind(), Some(TransientKind::Deadlock));
        // Three attempts, none committed on the primary.
        let begins = primary
            .events()
            .iter()
            .filter(|e| **e == TxEvent::Began)
            .count();
        assert_eq!(begins, 3);
        assert!(!primary.events().contains(&TxEvent::Committed));
    }

    #[tokio::test]
    async fn non_transient_primary_commit_failure_fails_call_and_rolls_back_secondary() {
        let primary = JournalStore {
            fail_commit: true,
            ..JournalStore::default()
        };
        let secondary = JournalStore::default();
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            true,
        );

        let err = coordinator
            .execute_in_transaction(&CancellationToken::new(), "create_user", write_both())
            .await
            .expect_err("primary commit failure fails the operation");

        assert!(matches!(err, StoreError::Other(_)));
        assert_eq!(
            secondary.events(),
            vec![TxEvent::Began, TxEvent::Executed, TxEvent::RolledBack]
        );
    }

    #[tokio::test]
    async fn secondary_commit_failure_is_success_with_drift() {
        let primary = JournalStore::default();
        let secondary = JournalStore {
            fail_commit: true,
            ..JournalStore::default()
        };
        let coordinator = DualWriteCoordinator::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            true,
        )
        .with_retry_policy(fast_retry(5));

        coordinator
            .execute_in_transaction(&CancellationToken::new(), "create_user", write_both())
            .await
            .expect("secondary drift must not fail the request");

        // Primary data is durably committed; the drift is not re-attempted.
        assert_eq!(
            primary.events(),
            vec![TxEvent::Began, TxEvent::Executed, TxEvent::Committed]
        );
        assert_eq!(secondary.events(), vec![TxEvent::Began, TxEvent::Executed]);
    }
}
