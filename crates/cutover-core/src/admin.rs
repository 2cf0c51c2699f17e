//! Administrative surface for operator tooling.
//!
//! Exposes the rollout getter/setter plus a serializable metrics snapshot of
//! both stores' connection pools, the current rollout percentage, and the
//! dual-write flag. Transport (admin endpoint, CLI) is a caller concern.

use std::sync::Arc;

use serde::Serialize;

use crate::config::PoolConfig;
use crate::router::{RolloutError, RolloutRouter};
use crate::store::{PoolMetrics, Store};

/// Pool-pressure classification against configured thresholds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageLevel {
    Ok,
    Warning,
    Critical,
    Emergency,
}

pub fn usage_level(metrics: &PoolMetrics, pool: &PoolConfig) -> UsageLevel {
    let percent = metrics.usage_percent() as u8;
    if percent >= pool.emergency_threshold {
        UsageLevel::Emergency
    } else if percent >= pool.critical_threshold {
        UsageLevel::Critical
    } else if percent >= pool.warning_threshold {
        UsageLevel::Warning
    } else {
        UsageLevel::Ok
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreMetrics {
    #[serde(flatten)]
    pub pool: PoolMetrics,
    pub usage_level: UsageLevel,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub legacy: StoreMetrics,
    pub target: StoreMetrics,
    pub rollout_percentage: u8,
    pub dual_write_enabled: bool,
}

pub struct AdminSurface {
    router: Arc<RolloutRouter>,
    legacy: Arc<dyn Store>,
    target: Arc<dyn Store>,
    pool_config: PoolConfig,
    dual_write_enabled: bool,
}

impl AdminSurface {
    pub fn new(
        router: Arc<RolloutRouter>,
        legacy: Arc<dyn Store>,
        target: Arc<dyn Store>,
        pool_config: PoolConfig,
        dual_write_enabled: bool,
    ) -> Self {
        Self {
            router,
            legacy,
            target,
            pool_config,
            dual_write_enabled,
        }
    }

    pub fn rollout_percentage(&self) -> u8 {
        self.router.rollout_percentage()
    }

    pub fn update_rollout_percentage(&self, percentage: i32) -> Result<(), RolloutError> {
        self.router.update_rollout_percentage(percentage)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let legacy = self.legacy.pool_metrics();
        let target = self.target.pool_metrics();
        MetricsSnapshot {
            legacy: StoreMetrics {
                usage_level: usage_level(&legacy, &self.pool_config),
                pool: legacy,
            },
            target: StoreMetrics {
                usage_level: usage_level(&target, &self.pool_config),
                pool: target,
            },
            rollout_percentage: self.router.rollout_percentage(),
            dual_write_enabled: self.dual_write_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreError;
    use crate::store::{Row, StoreTx, Value};

    struct FixedMetricsStore {
        metrics: PoolMetrics,
    }

    #[async_trait]
    impl Store for FixedMetricsStore {
        async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
            Err(StoreError::Unavailable("metrics-only store".into()))
        }

        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, StoreError> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        fn pool_metrics(&self) -> PoolMetrics {
            self.metrics
        }
    }

    fn metrics_with_usage(in_use: u32) -> PoolMetrics {
        PoolMetrics {
            max_open_connections: 100,
            open_connections: in_use,
            in_use_connections: in_use,
            ..PoolMetrics::default()
        }
    }

    #[test]
    fn usage_levels_follow_thresholds() {
        let pool = PoolConfig::default();
        assert_eq!(usage_level(&metrics_with_usage(10), &pool), UsageLevel::Ok);
        assert_eq!(
            usage_level(&metrics_with_usage(65), &pool),
            UsageLevel::Warning
        );
        assert_eq!(
            usage_level(&metrics_with_usage(85), &pool),
            UsageLevel::Critical
        );
        assert_eq!(
            usage_level(&metrics_with_usage(95), &pool),
            UsageLevel::Emergency
        );
    }

    #[test]
    fn snapshot_reflects_router_and_both_pools() {
        let router = Arc::new(RolloutRouter::new(30, false).expect("valid percentage"));
        let admin = AdminSurface::new(
            router.clone(),
            Arc::new(FixedMetricsStore {
                metrics: metrics_with_usage(5),
            }),
            Arc::new(FixedMetricsStore {
                metrics: metrics_with_usage(85),
            }),
            PoolConfig::default(),
            true,
        );

        let snapshot = admin.metrics();
        assert_eq!(snapshot.rollout_percentage, 30);
        assert!(snapshot.dual_write_enabled);
        assert_eq!(snapshot.legacy.usage_level, UsageLevel::Ok);
        assert_eq!(snapshot.target.usage_level, UsageLevel::Critical);

        admin.update_rollout_percentage(55).expect("in range");
        assert_eq!(admin.metrics().rollout_percentage, 55);

        let json = serde_json::to_value(admin.metrics()).expect("serializes");
        assert_eq!(json["rollout_percentage"], 55);
        assert_eq!(json["legacy"]["in_use_connections"], 5);
    }
}
