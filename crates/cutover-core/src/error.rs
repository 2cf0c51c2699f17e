//! Typed store-error classification.
//!
//! Retry decisions operate on [TransientKind] categories produced by the
//! driver adapter, never on error-message text. The adapter is the only
//! place allowed to inspect SQLSTATE codes or driver error strings.

use std::fmt;

/// Category of store error that is expected to resolve on retry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransientKind {
    /// Two transactions each held a lock the other needed (SQLSTATE 40P01).
    Deadlock,
    /// Serializable/repeatable-read conflict (SQLSTATE 40001).
    SerializationFailure,
    /// A lock could not be acquired in time (SQLSTATE 55P03).
    LockTimeout,
    /// The statement or the attempt deadline expired (SQLSTATE 57014).
    StatementTimeout,
    /// The connection dropped mid-operation (SQLSTATE class 08, resets).
    ConnectionLost,
    /// The server or client pool ran out of connections (SQLSTATE 53300).
    PoolExhausted,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::Deadlock => "deadlock_detected",
            TransientKind::SerializationFailure => "serialization_failure",
            TransientKind::LockTimeout => "lock_timeout",
            TransientKind::StatementTimeout => "statement_timeout",
            TransientKind::ConnectionLost => "connection_lost",
            TransientKind::PoolExhausted => "pool_exhausted",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced by a [crate::store::Store] implementation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    /// Expected to resolve on retry under an appropriate policy.
    #[error("transient store error ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },
    /// Unique/foreign-key/check violation. Never retried.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// Malformed statement, unknown column or table. Never retried.
    #[error("invalid statement: {0}")]
    Statement(String),
    /// The store could not be reached at all (setup, ping).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Anything the adapter could not classify more precisely.
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        StoreError::Transient {
            kind,
            message: message.into(),
        }
    }

    /// The transient category, if this error has one.
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            StoreError::Transient { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Short stable code used in retry stats and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Transient { kind, .. } => kind.as_str(),
            StoreError::Constraint(_) => "constraint_violation",
            StoreError::Statement(_) => "invalid_statement",
            StoreError::Unavailable(_) => "store_unavailable",
            StoreError::Other(_) => "store_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kind_round_trips_through_code() {
        let err = StoreError::transient(TransientKind::Deadlock, "deadlock detected");
        assert_eq!(err.code(), "deadlock_detected");
        assert_eq!(err.transient_kind(), Some(TransientKind::Deadlock));
    }

    #[test]
    fn non_transient_errors_have_no_kind() {
        let err = StoreError::Constraint("duplicate key".to_string());
        assert_eq!(err.transient_kind(), None);
        assert_eq!(err.code(), "constraint_violation");
    }
}
