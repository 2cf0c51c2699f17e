//! Postgres-backed [Store] implementation over sqlx.
//!
//! This is the only module that sees `sqlx::Error`; everything above the
//! [Store] boundary works with the typed classification from
//! [crate::error]. SQLSTATE reference:
//! <https://www.postgresql.org/docs/current/errcodes-appendix.html>
//!
//! Parameter note: values cross the boundary as [Value], so NULLs and text
//! are sent with text typing. Insert templates targeting columns without an
//! assignment cast from text (uuid, enums) should cast explicitly, e.g.
//! `$1::uuid`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Postgres, Row as _, Transaction, TypeInfo};

use crate::config::PoolConfig;
use crate::error::{StoreError, TransientKind};
use crate::store::{PoolMetrics, Row, Store, StoreTx, Value};

pub struct PgStore {
    pool: PgPool,
    max_connections: u32,
}

impl PgStore {
    pub async fn connect(dsn: &str, config: &PoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(dsn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            pool,
            max_connections: config.max_connections,
        })
    }

    pub fn with_pool(pool: PgPool, max_connections: u32) -> Self {
        Self {
            pool,
            max_connections,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(classify)?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(decode_row).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    fn pool_metrics(&self) -> PoolMetrics {
        let open = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolMetrics {
            max_open_connections: self.max_connections,
            open_connections: open,
            in_use_connections: open.saturating_sub(idle),
            idle_connections: idle,
            // sqlx does not expose acquire-wait counters on the pool.
            wait_count: 0,
            wait_duration_ms: 0,
        }
    }
}

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, StoreError> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(classify)?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(classify)
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_params<'q>(mut query: PgQuery<'q>, params: &'q [Value]) -> PgQuery<'q> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bytes(v) => query.bind(v.as_slice()),
            Value::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, StoreError> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        values.push(decode_value(row, index, column.type_info().name())?);
    }
    Ok(values)
}

fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value, StoreError> {
    let decode_err =
        |e: sqlx::Error| StoreError::Other(format!("decode column {index} ({type_name}): {e}"));

    let value = match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, |v| Value::Int(i64::from(v))),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, |v| Value::Int(i64::from(v))),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, Value::Int),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, |v| Value::Float(f64::from(v))),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, Value::Float),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => row
            .try_get::<Option<String>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, Value::Text),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, Value::Bytes),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, Value::Timestamp),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, |v| Value::Timestamp(v.and_utc())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .map_err(decode_err)?
            .and_then(|v| v.and_hms_opt(0, 0, 0))
            .map_or(Value::Null, |v| Value::Timestamp(v.and_utc())),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .map_err(decode_err)?
            .map_or(Value::Null, |v| Value::Text(v.to_string())),
        other => {
            return Err(StoreError::Other(format!(
                "unsupported column type {other} at index {index}"
            )))
        }
    };
    Ok(value)
}

/// Maps a driver error onto the typed taxonomy the retry policies consume.
fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                "40P01" => StoreError::transient(TransientKind::Deadlock, message),
                "40001" => StoreError::transient(TransientKind::SerializationFailure, message),
                "55P03" => StoreError::transient(TransientKind::LockTimeout, message),
                "57014" => StoreError::transient(TransientKind::StatementTimeout, message),
                "53300" | "53200" | "53100" | "53000" => {
                    StoreError::transient(TransientKind::PoolExhausted, message)
                }
                c if c.starts_with("08") => {
                    StoreError::transient(TransientKind::ConnectionLost, message)
                }
                c if c.starts_with("23") => StoreError::Constraint(message),
                c if c.starts_with("42") => StoreError::Statement(message),
                _ => StoreError::Other(message),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::transient(TransientKind::PoolExhausted, "pool acquire timed out")
        }
        sqlx::Error::PoolClosed => StoreError::Unavailable("pool closed".to_string()),
        sqlx::Error::Io(io) => StoreError::transient(TransientKind::ConnectionLost, io.to_string()),
        _ => StoreError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_and_pool_errors_classify_as_transient() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert_eq!(
            classify(io).transient_kind(),
            Some(TransientKind::ConnectionLost)
        );
        assert_eq!(
            classify(sqlx::Error::PoolTimedOut).transient_kind(),
            Some(TransientKind::PoolExhausted)
        );
    }

    #[test]
    fn row_not_found_is_not_transient() {
        assert_eq!(classify(sqlx::Error::RowNotFound).transient_kind(), None);
    }
}
