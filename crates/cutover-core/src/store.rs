//! Relational-store collaborator boundary.
//!
//! The orchestration core never talks to a driver directly. Both the legacy
//! and the target store are handed in as [Store] trait objects, which keeps
//! the router, coordinator, executor, and backfill controller testable
//! against in-memory fakes and agnostic to which side is which.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;

/// A single cell value crossing the store boundary.
///
/// Deliberately small: the cutover path only needs enough type fidelity to
/// carry rows between stores and to normalize timestamps on the way.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

/// One row as a positional list of values.
pub type Row = Vec<Value>;

/// First column of the first row as an integer, for COUNT-style queries.
pub fn scalar_i64(rows: &[Row]) -> Option<i64> {
    match rows.first().and_then(|row| row.first()) {
        Some(Value::Int(n)) => Some(*n),
        _ => None,
    }
}

/// Connection-pool counters reported by a store, admin-surface shape.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PoolMetrics {
    pub max_open_connections: u32,
    pub open_connections: u32,
    pub in_use_connections: u32,
    pub idle_connections: u32,
    pub wait_count: u64,
    pub wait_duration_ms: u64,
}

impl PoolMetrics {
    pub fn usage_percent(&self) -> f64 {
        if self.max_open_connections == 0 {
            return 0.0;
        }
        f64::from(self.in_use_connections) * 100.0 / f64::from(self.max_open_connections)
    }
}

/// A relational store capable of transactions, parameterized statements,
/// and pool introspection.
#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a transaction. The handle is owned exclusively by the caller
    /// and must be resolved with `commit` or `rollback`.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Runs a parameterized query outside any transaction.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;

    /// Connectivity check with a bounded internal timeout.
    async fn ping(&self) -> Result<(), StoreError>;

    fn pool_metrics(&self) -> PoolMetrics;
}

/// An open transaction on a [Store].
#[async_trait]
pub trait StoreTx: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, StoreError>;

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_i64_reads_first_cell() {
        let rows = vec![vec![Value::Int(42), Value::Text("x".into())]];
        assert_eq!(scalar_i64(&rows), Some(42));
        assert_eq!(scalar_i64(&[]), None);
        assert_eq!(scalar_i64(&[vec![Value::Null]]), None);
    }

    #[test]
    fn pool_usage_percent_handles_zero_capacity() {
        let metrics = PoolMetrics::default();
        assert_eq!(metrics.usage_percent(), 0.0);

        let metrics = PoolMetrics {
            max_open_connections: 20,
            in_use_connections: 15,
            ..PoolMetrics::default()
        };
        assert_eq!(metrics.usage_percent(), 75.0);
    }
}
