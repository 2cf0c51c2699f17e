//! Retry policies with exponential backoff and jitter.
//!
//! Policies are immutable configuration values; the named presets mirror the
//! workload classes the transaction executor serves. Classification is by
//! [TransientKind], so a policy can retry serialization failures for critical
//! writes while leaving them fatal for cheap read paths.

use std::time::Duration;

use serde::Serialize;

use crate::error::{StoreError, TransientKind};

const ALL_TRANSIENT: [TransientKind; 6] = [
    TransientKind::Deadlock,
    TransientKind::SerializationFailure,
    TransientKind::LockTimeout,
    TransientKind::StatementTimeout,
    TransientKind::ConnectionLost,
    TransientKind::PoolExhausted,
];

/// Backoff and eligibility configuration for one workload class.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Exponential growth factor, > 1.
    pub multiplier: f64,
    /// Fraction of the computed delay used as symmetric jitter, in [0, 1].
    pub jitter_factor: f64,
    pub jitter_enabled: bool,
    /// Transient categories this policy is willing to retry.
    pub retryable: Vec<TransientKind>,
}

impl RetryPolicy {
    /// Cheap read paths: a couple of quick retries on connection hiccups only.
    pub fn read_only() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.1,
            jitter_enabled: true,
            retryable: vec![
                TransientKind::ConnectionLost,
                TransientKind::PoolExhausted,
                TransientKind::StatementTimeout,
            ],
        }
    }

    /// Default for interactive writes.
    pub fn read_write() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.1,
            jitter_enabled: true,
            retryable: vec![
                TransientKind::Deadlock,
                TransientKind::SerializationFailure,
                TransientKind::LockTimeout,
                TransientKind::ConnectionLost,
                TransientKind::PoolExhausted,
            ],
        }
    }

    /// Serializable money-path writes: retries every transient category,
    /// serialization conflicts most of all.
    pub fn critical() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.2,
            jitter_enabled: true,
            retryable: ALL_TRANSIENT.to_vec(),
        }
    }

    /// Long-running backfill batches: few retries, generous backoff.
    pub fn batch() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 3.0,
            jitter_factor: 0.2,
            jitter_enabled: true,
            retryable: ALL_TRANSIENT.to_vec(),
        }
    }

    /// Reporting reads: tolerate lock contention, back off slowly.
    pub fn reporting() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.1,
            jitter_enabled: true,
            retryable: vec![
                TransientKind::LockTimeout,
                TransientKind::StatementTimeout,
                TransientKind::ConnectionLost,
                TransientKind::PoolExhausted,
            ],
        }
    }

    pub fn is_retryable(&self, err: &StoreError) -> bool {
        match err.transient_kind() {
            Some(kind) => self.retryable.contains(&kind),
            None => false,
        }
    }

    /// Delay before retry number `attempt + 1`:
    /// `min(base * multiplier^attempt, max)`, perturbed by up to
    /// `±jitter_factor * delay` to spread concurrent retriers apart.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let mut delay = exp.min(self.max_delay.as_secs_f64());

        if self.jitter_enabled {
            let spread = rand::random::<f64>() * 2.0 - 1.0;
            delay += delay * self.jitter_factor * spread;
            if delay < 0.0 {
                delay = self.base_delay.as_secs_f64();
            }
        }

        Duration::from_secs_f64(delay)
    }
}

/// Per-operation retry observability, handed to the caller by value.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RetryStats {
    pub operation: String,
    pub total_attempts: u32,
    pub total_duration: Duration,
    /// True when the operation succeeded after at least one retry.
    pub successful_retry: bool,
    /// Error codes observed, in attempt order.
    pub error_codes: Vec<String>,
}

impl RetryStats {
    pub fn for_operation(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }
}
