//! Phased bulk backfill controller.
//!
//! Phases run strictly one after another; a phase with any failed table
//! stops the run before the next phase starts. Tables inside a phase fan out
//! over a semaphore-bounded worker pool, and each table is a single task
//! walking ascending batches so offsets never interleave. One target
//! transaction per batch, executed under the batch retry policy.
//!
//! Re-running a partially completed migration is the caller's idempotency
//! problem: either truncate the target tables first or use insert templates
//! that tolerate existing rows (`ON CONFLICT DO NOTHING`).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cutover_core::{scalar_i64, txn_fn, Row, Store, TxnError, TxnExecutor};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::convert::convert_row;
use crate::plan::{MigrationPhase, TableMigration};

/// Run-wide counters, mutated under a mutex with narrow critical sections.
#[derive(Clone, Debug)]
pub struct MigrationStats {
    pub tables_completed: u32,
    /// Actual rows copied, not offsets walked.
    pub records_processed: i64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub errors: Vec<String>,
}

impl MigrationStats {
    fn new() -> Self {
        Self {
            tables_completed: 0,
            records_processed: 0,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("counting rows: {0}")]
    Count(#[source] cutover_core::StoreError),
    #[error("reading batch at offset {offset}: {source}")]
    Read {
        offset: i64,
        #[source]
        source: cutover_core::StoreError,
    },
    #[error("writing batch at offset {offset}: {source}")]
    Write {
        offset: i64,
        #[source]
        source: TxnError,
    },
    #[error("cancelled at offset {offset}")]
    Cancelled { offset: i64 },
    #[error("worker task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
#[error("table '{table}': {cause}")]
pub struct TableFailure {
    pub table: String,
    #[source]
    pub cause: TableError,
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("phase '{phase}' finished with {} failed table(s)", failures.len())]
    Phase {
        phase: String,
        failures: Vec<TableFailure>,
    },
    #[error("migration cancelled before phase '{phase}' completed")]
    Cancelled { phase: String },
}

pub struct MigrationController {
    source: Arc<dyn Store>,
    target: TxnExecutor,
    phases: Vec<MigrationPhase>,
    default_batch_size: usize,
    stats: Arc<Mutex<MigrationStats>>,
}

impl MigrationController {
    pub fn new(
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        phases: Vec<MigrationPhase>,
        default_batch_size: usize,
    ) -> Self {
        Self {
            source,
            target: TxnExecutor::new(target),
            phases,
            default_batch_size,
            stats: Arc::new(Mutex::new(MigrationStats::new())),
        }
    }

    /// Snapshot of the run-wide counters.
    pub fn stats(&self) -> MigrationStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn execute_migration(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), MigrationError> {
        let started = Instant::now();
        let table_count: usize = self.phases.iter().map(|p| p.tables.len()).sum();
        tracing::info!(
            phases = self.phases.len(),
            tables = table_count,
            batch_size = self.default_batch_size,
            "bulk migration started"
        );

        let result = self.run_phases(cancel).await;

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.duration = started.elapsed();
        tracing::info!(
            tables_completed = stats.tables_completed,
            records_processed = stats.records_processed,
            elapsed_ms = stats.duration.as_millis() as u64,
            errors = stats.errors.len(),
            "bulk migration finished"
        );
        drop(stats);

        result
    }

    async fn run_phases(&self, cancel: &CancellationToken) -> Result<(), MigrationError> {
        for phase in &self.phases {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled {
                    phase: phase.name.clone(),
                });
            }
            self.run_phase(phase, cancel).await?;
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        phase: &MigrationPhase,
        cancel: &CancellationToken,
    ) -> Result<(), MigrationError> {
        tracing::info!(
            phase = %phase.name,
            tables = phase.tables.len(),
            workers = phase.worker_limit,
            "phase started"
        );

        let semaphore = Arc::new(Semaphore::new(phase.worker_limit));
        let mut workers: JoinSet<Result<String, TableFailure>> = JoinSet::new();

        for table in phase.tables.clone() {
            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let target = self.target.clone();
            let stats = self.stats.clone();
            let cancel = cancel.clone();
            let batch_size = table.batch_size.unwrap_or(self.default_batch_size);

            workers.spawn(async move {
                let name = table.name.clone();
                let _permit = semaphore.acquire_owned().await.map_err(|_| TableFailure {
                    table: name.clone(),
                    cause: TableError::Cancelled { offset: 0 },
                })?;
                migrate_table(source, target, stats, cancel, table, batch_size)
                    .await
                    .map(|()| name.clone())
                    .map_err(|cause| TableFailure { table: name, cause })
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(table)) => {
                    let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
                    stats.tables_completed += 1;
                    drop(stats);
                    tracing::debug!(phase = %phase.name, table = %table, "table worker finished");
                }
                Ok(Err(failure)) => {
                    tracing::error!(phase = %phase.name, table = %failure.table,
                        error = %failure, "table migration failed");
                    failures.push(failure);
                }
                Err(join_err) => {
                    failures.push(TableFailure {
                        table: "<unknown>".to_string(),
                        cause: TableError::Task(join_err.to_string()),
                    });
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(phase = %phase.name, "phase completed");
            return Ok(());
        }

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        for failure in &failures {
            stats.errors.push(failure.to_string());
        }
        drop(stats);

        Err(MigrationError::Phase {
            phase: phase.name.clone(),
            failures,
        })
    }
}

/// Copies one table: COUNT, then ascending fixed-size batches, each written
/// in its own target transaction. Runs as a single task so batch offsets are
/// strictly ordered.
async fn migrate_table(
    source: Arc<dyn Store>,
    target: TxnExecutor,
    stats: Arc<Mutex<MigrationStats>>,
    cancel: CancellationToken,
    table: TableMigration,
    batch_size: usize,
) -> Result<(), TableError> {
    let started = Instant::now();

    let count_sql = format!("SELECT COUNT(*) FROM {}", table.name);
    let rows = source.query(&count_sql, &[]).await.map_err(TableError::Count)?;
    let total = scalar_i64(&rows).unwrap_or(0);

    if total == 0 {
        tracing::debug!(table = %table.name, "no rows, skipping");
        return Ok(());
    }
    tracing::info!(table = %table.name, total, batch_size, "table migration started");

    let insert = Arc::new(table.insert_template.clone());
    let mut processed: i64 = 0;
    let mut offset: i64 = 0;

    while offset < total {
        if cancel.is_cancelled() {
            return Err(TableError::Cancelled { offset });
        }

        let batch_sql = format!("{} LIMIT {batch_size} OFFSET {offset}", table.source_query);
        let batch = source
            .query(&batch_sql, &[])
            .await
            .map_err(|source| TableError::Read { offset, source })?;
        if batch.is_empty() {
            break;
        }

        let converted: Arc<Vec<Row>> = Arc::new(batch.into_iter().map(convert_row).collect());
        let body = {
            let converted = converted.clone();
            let insert = insert.clone();
            txn_fn(move |tx| {
                let converted = converted.clone();
                let insert = insert.clone();
                Box::pin(async move {
                    for row in converted.iter() {
                        tx.execute(&insert, row).await?;
                    }
                    Ok(())
                })
            })
        };

        target
            .execute_batch(&cancel, &table.name, batch_size, &body)
            .await
            .map_err(|source| match source {
                TxnError::Cancelled { .. } => TableError::Cancelled { offset },
                source => TableError::Write { offset, source },
            })?;

        let batch_rows = converted.len() as i64;
        processed += batch_rows;
        {
            let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.records_processed += batch_rows;
        }

        let percent = (processed as f64 * 1000.0 / total as f64).round() / 10.0;
        tracing::debug!(table = %table.name, processed, total, percent, "batch committed");

        offset += batch_size as i64;
    }

    let elapsed = started.elapsed();
    let rows_per_sec = (processed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)).round();
    tracing::info!(table = %table.name, rows = processed,
        elapsed_ms = elapsed.as_millis() as u64, rows_per_sec,
        "table migration completed");

    Ok(())
}
