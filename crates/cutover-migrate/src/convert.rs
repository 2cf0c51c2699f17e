//! Per-row value normalization applied between the stores.
//!
//! The legacy store tolerates zero timestamps where the target enforces real
//! ones or NULL, so zero timestamps become NULL on the way over. Binary
//! payloads and everything else pass through untouched; timestamps are
//! already UTC at the store boundary.

use chrono::Datelike;
use cutover_core::{Row, Value};

pub fn convert_row(row: Row) -> Row {
    row.into_iter().map(convert_value).collect()
}

pub fn convert_value(value: Value) -> Value {
    match value {
        // The legacy zero timestamp renders as year 1 (or below after
        // timezone adjustment); neither is a real application date.
        Value::Timestamp(ts) if ts.year() <= 1 => Value::Null,
        other => other,
    }
}
