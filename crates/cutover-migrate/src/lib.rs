//! # cutover-migrate
//!
//! Bulk backfill from the legacy store into the cutover target: a
//! hand-authored phase plan in dependency order, per-row value
//! normalization, and a controller that copies tables in bounded-concurrency
//! batches with one retryable target transaction per batch.

pub mod controller;
pub mod convert;
pub mod plan;

pub use controller::{MigrationController, MigrationError, MigrationStats, TableFailure};
pub use convert::{convert_row, convert_value};
pub use plan::{default_phases, insert_values_template, MigrationPhase, TableMigration};
