//! Bulk backfill CLI.
//!
//! Connects to both stores, pings them, then runs the default phase plan.
//! An overall deadline and ctrl-c both trip the cancellation token, which
//! the controller honors at batch and phase boundaries.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cutover_core::{CutoverConfig, PgStore, Store};
use cutover_migrate::{default_phases, MigrationController};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cutover-migrate", about = "Bulk backfill from the legacy store to the target")]
struct Args {
    #[arg(long, default_value = "localhost")]
    source_host: String,
    #[arg(long, default_value_t = 5432)]
    source_port: u16,
    #[arg(long, default_value = "app")]
    source_db: String,
    #[arg(long, default_value = "postgres")]
    source_user: String,
    #[arg(long, default_value = "")]
    source_password: String,

    #[arg(long, default_value = "localhost")]
    target_host: String,
    #[arg(long, default_value_t = 5432)]
    target_port: u16,
    #[arg(long, default_value = "app")]
    target_db: String,
    #[arg(long, default_value = "postgres")]
    target_user: String,
    #[arg(long, default_value = "")]
    target_password: String,

    /// Rows per target transaction, unless the plan overrides per table.
    #[arg(long, default_value_t = 10000)]
    batch_size: usize,
    /// Caps every phase's worker limit when set.
    #[arg(long)]
    workers: Option<usize>,
    /// Overall deadline for the run, in seconds.
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,
    #[arg(long)]
    verbose: bool,
}

fn dsn(user: &str, password: &str, host: &str, port: u16, db: &str) -> String {
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "migration failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let pool = CutoverConfig::from_env()?.pool;

    let source_dsn = dsn(
        &args.source_user,
        &args.source_password,
        &args.source_host,
        args.source_port,
        &args.source_db,
    );
    let target_dsn = dsn(
        &args.target_user,
        &args.target_password,
        &args.target_host,
        args.target_port,
        &args.target_db,
    );

    let source = Arc::new(PgStore::connect(&source_dsn, &pool).await?);
    let target = Arc::new(PgStore::connect(&target_dsn, &pool).await?);
    source.ping().await?;
    target.ping().await?;
    tracing::info!("both stores reachable");

    let mut phases = default_phases();
    if let Some(workers) = args.workers {
        for phase in &mut phases {
            phase.worker_limit = phase.worker_limit.min(workers.max(1));
        }
    }

    let controller = MigrationController::new(source, target, phases, args.batch_size);

    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    let timeout = Duration::from_secs(args.timeout_secs);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        tracing::warn!(timeout_secs = timeout.as_secs(), "deadline reached, cancelling");
        deadline.cancel();
    });
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    let result = controller.execute_migration(&cancel).await;
    let stats = controller.stats();
    tracing::info!(
        tables_completed = stats.tables_completed,
        records_processed = stats.records_processed,
        elapsed_ms = stats.duration.as_millis() as u64,
        "final statistics"
    );
    for error in &stats.errors {
        tracing::error!(error = %error, "table failure");
    }

    result?;
    Ok(())
}
