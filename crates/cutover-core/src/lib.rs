//! # cutover-core
//!
//! Live-migration orchestration between a legacy relational store and its
//! replacement: percentage-based routing, best-effort dual writes, and
//! retryable transaction execution over a driver-agnostic store boundary.
//!
//! ## Overview
//!
//! - **Router** — deterministic, monotonic percentage rollout keyed by a
//!   stable entity hash
//! - **Dual write** — independent transactions on both stores, primary
//!   commits first, secondary drift is logged rather than fatal
//! - **Txn executor** — isolation, per-attempt timeouts, typed transient
//!   classification, and preset retry policies with exponential backoff
//! - **Store boundary** — [Store]/[StoreTx] trait objects with a Postgres
//!   implementation in [pg]; everything above it tests against fakes
//! - **Admin** — rollout getter/setter plus a serializable pool-metrics
//!   snapshot for operator tooling
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cutover_core::{CutoverConfig, PgStore, RolloutRouter, StoreSide};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CutoverConfig::from_env()?;
//! let legacy = Arc::new(PgStore::connect("postgres://legacy/app", &config.pool).await?);
//! let target = Arc::new(PgStore::connect("postgres://target/app", &config.pool).await?);
//! let router = RolloutRouter::from_config(&config);
//!
//! let store = match router.write_store("user-42") {
//!     StoreSide::Legacy => legacy,
//!     StoreSide::Target => target,
//! };
//! store.ping().await?;
//! # Ok(()) }
//! ```

pub mod admin;
pub mod config;
pub mod dual_write;
pub mod error;
pub mod pg;
pub mod retry;
pub mod router;
pub mod store;
pub mod txn;

pub use admin::{AdminSurface, MetricsSnapshot, StoreMetrics, UsageLevel};
pub use config::{CutoverConfig, PoolConfig};
pub use dual_write::{dual_write_fn, DualWriteCoordinator};
pub use error::{StoreError, TransientKind};
pub use pg::PgStore;
pub use retry::{RetryPolicy, RetryStats};
pub use router::{RolloutError, RolloutRouter, StoreSide};
pub use store::{scalar_i64, PoolMetrics, Row, Store, StoreTx, Value};
pub use txn::{txn_fn, IsolationLevel, TxnConfig, TxnError, TxnExecutor};
