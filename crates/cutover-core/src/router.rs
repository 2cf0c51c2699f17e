//! Percentage-based traffic routing between the legacy and target stores.
//!
//! A key's bucket is derived from a truncated SHA-256 digest, so the same
//! entity always lands on the same store for a fixed percentage, and raising
//! the percentage only ever moves keys legacy -> target. The router is an
//! injected instance, not process-global state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use sha2::{Digest, Sha256};

use crate::config::CutoverConfig;

/// Which side of the cutover should serve a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreSide {
    Legacy,
    Target,
}

#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error("rollout percentage {0} is out of range (expected 0..=100)")]
    OutOfRange(i32),
}

/// Process-wide rollout state: many concurrent readers, rare writers.
pub struct RolloutRouter {
    percentage: RwLock<u8>,
    read_from_target: AtomicBool,
}

impl RolloutRouter {
    pub fn new(percentage: i32, read_from_target: bool) -> Result<Self, RolloutError> {
        if !(0..=100).contains(&percentage) {
            return Err(RolloutError::OutOfRange(percentage));
        }
        Ok(Self {
            percentage: RwLock::new(percentage as u8),
            read_from_target: AtomicBool::new(read_from_target),
        })
    }

    pub fn from_config(config: &CutoverConfig) -> Self {
        Self {
            percentage: RwLock::new(config.rollout_percentage),
            read_from_target: AtomicBool::new(config.read_from_target),
        }
    }

    /// Stable bucket in 0..100 for a routing key.
    fn bucket(key: &str) -> u8 {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % 100) as u8
    }

    /// Write-routing decision: `hash(key) % 100 < percentage`.
    pub fn should_use_target(&self, key: &str) -> bool {
        let percentage = *self
            .percentage
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Self::bucket(key) < percentage
    }

    pub fn write_store(&self, key: &str) -> StoreSide {
        if self.should_use_target(key) {
            StoreSide::Target
        } else {
            StoreSide::Legacy
        }
    }

    /// Read-routing decision; independent of writes when reads are forced to
    /// the target for validation.
    pub fn read_store(&self, key: &str) -> StoreSide {
        if self.read_from_target.load(Ordering::Relaxed) || self.should_use_target(key) {
            StoreSide::Target
        } else {
            StoreSide::Legacy
        }
    }

    pub fn rollout_percentage(&self) -> u8 {
        *self
            .percentage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Administrative setter. Rejects out-of-range values without touching
    /// the stored percentage.
    pub fn update_rollout_percentage(&self, percentage: i32) -> Result<(), RolloutError> {
        if !(0..=100).contains(&percentage) {
            return Err(RolloutError::OutOfRange(percentage));
        }
        let mut guard = self
            .percentage
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = *guard;
        *guard = percentage as u8;
        drop(guard);
        tracing::info!(previous, percentage, "rollout percentage updated");
        Ok(())
    }

    pub fn set_read_from_target(&self, enabled: bool) {
        self.read_from_target.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keys() -> Vec<String> {
        (0..500).map(|i| format!("user-{i}")).collect()
    }

    #[test]
    fn routing_is_deterministic_for_fixed_percentage() {
        let router = RolloutRouter::new(37, false).expect("valid percentage");
        for key in sample_keys() {
            let first = router.should_use_target(&key);
            for _ in 0..5 {
                assert_eq!(router.should_use_target(&key), first);
            }
        }
    }

    #[test]
    fn rollout_is_monotonic_in_percentage() {
        let router = RolloutRouter::new(0, false).expect("valid percentage");
        let keys = sample_keys();
        let mut previous: Vec<String> = Vec::new();

        for percentage in [0, 10, 25, 50, 75, 100] {
            router
                .update_rollout_percentage(percentage)
                .expect("in range");
            let current: Vec<String> = keys
                .iter()
                .filter(|k| router.should_use_target(k))
                .cloned()
                .collect();
            for key in &previous {
                assert!(
                    current.contains(key),
                    "key {key} moved back to legacy at {percentage}%"
                );
            }
            previous = current;
        }
    }

    #[test]
    fn boundary_percentages_route_everything_one_way() {
        let router = RolloutRouter::new(0, false).expect("valid percentage");
        for key in sample_keys() {
            assert!(!router.should_use_target(&key));
            assert_eq!(router.write_store(&key), StoreSide::Legacy);
        }

        router.update_rollout_percentage(100).expect("in range");
        for key in sample_keys() {
            assert!(router.should_use_target(&key));
            assert_eq!(router.write_store(&key), StoreSide::Target);
        }
    }

    #[test]
    fn out_of_range_update_fails_and_leaves_percentage_unchanged() {
        let router = RolloutRouter::new(42, false).expect("valid percentage");
        for bad in [-1, 101, 500] {
            let err = router.update_rollout_percentage(bad).expect_err("rejected");
            assert!(matches!(err, RolloutError::OutOfRange(p) if p == bad));
            assert_eq!(router.rollout_percentage(), 42);
        }
    }

    #[test]
    fn constructor_rejects_out_of_range_percentage() {
        assert!(RolloutRouter::new(101, false).is_err());
        assert!(RolloutRouter::new(-5, false).is_err());
    }

    #[test]
    fn read_routing_can_diverge_from_write_routing() {
        let router = RolloutRouter::new(0, true).expect("valid percentage");
        for key in sample_keys().into_iter().take(50) {
            assert_eq!(router.write_store(&key), StoreSide::Legacy);
            assert_eq!(router.read_store(&key), StoreSide::Target);
        }

        router.set_read_from_target(false);
        for key in sample_keys().into_iter().take(50) {
            assert_eq!(router.read_store(&key), StoreSide::Legacy);
        }
    }
}
