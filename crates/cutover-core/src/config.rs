//! Environment-driven cutover configuration.

use std::collections::HashMap;
use std::time::Duration;

const ENV_KEYS: [&str; 9] = [
    "CUTOVER_ROLLOUT_PERCENTAGE",
    "CUTOVER_DUAL_WRITE",
    "CUTOVER_READ_FROM_TARGET",
    "CUTOVER_DB_MAX_CONNECTIONS",
    "CUTOVER_DB_MIN_CONNECTIONS",
    "CUTOVER_DB_ACQUIRE_TIMEOUT_MS",
    "CUTOVER_POOL_WARNING_THRESHOLD",
    "CUTOVER_POOL_CRITICAL_THRESHOLD",
    "CUTOVER_POOL_EMERGENCY_THRESHOLD",
];

/// Connection-pool sizing and alerting thresholds, shared by both stores.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Usage-percent thresholds for the admin metrics surface.
    pub warning_threshold: u8,
    pub critical_threshold: u8,
    pub emergency_threshold: u8,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            warning_threshold: 60,
            critical_threshold: 80,
            emergency_threshold: 90,
        }
    }
}

/// Settings the routing and dual-write core reads at process start.
#[derive(Clone, Debug)]
pub struct CutoverConfig {
    /// 0 means "stay on legacy"; 100 routes every key to the target.
    pub rollout_percentage: u8,
    pub dual_write_enabled: bool,
    /// Forces read traffic to the target independent of the write rollout.
    pub read_from_target: bool,
    pub pool: PoolConfig,
}

impl Default for CutoverConfig {
    fn default() -> Self {
        Self {
            rollout_percentage: 0,
            dual_write_enabled: false,
            read_from_target: false,
            pool: PoolConfig::default(),
        }
    }
}

impl CutoverConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(raw) = envs.get("CUTOVER_ROLLOUT_PERCENTAGE") {
            let percentage: i64 = raw
                .trim()
                .parse()
                .map_err(|_| format!("invalid CUTOVER_ROLLOUT_PERCENTAGE='{raw}'"))?;
            if !(0..=100).contains(&percentage) {
                return Err(format!(
                    "CUTOVER_ROLLOUT_PERCENTAGE={percentage} is out of range (expected 0..=100)"
                ));
            }
            config.rollout_percentage = percentage as u8;
        }

        if let Some(raw) = envs.get("CUTOVER_DUAL_WRITE") {
            config.dual_write_enabled = parse_bool(raw);
        }
        if let Some(raw) = envs.get("CUTOVER_READ_FROM_TARGET") {
            config.read_from_target = parse_bool(raw);
        }

        if let Some(raw) = envs.get("CUTOVER_DB_MAX_CONNECTIONS") {
            config.pool.max_connections = parse_u32("CUTOVER_DB_MAX_CONNECTIONS", raw)?;
        }
        if let Some(raw) = envs.get("CUTOVER_DB_MIN_CONNECTIONS") {
            config.pool.min_connections = parse_u32("CUTOVER_DB_MIN_CONNECTIONS", raw)?;
        }
        if let Some(raw) = envs.get("CUTOVER_DB_ACQUIRE_TIMEOUT_MS") {
            let ms = parse_u32("CUTOVER_DB_ACQUIRE_TIMEOUT_MS", raw)?;
            config.pool.acquire_timeout = Duration::from_millis(u64::from(ms));
        }

        if let Some(raw) = envs.get("CUTOVER_POOL_WARNING_THRESHOLD") {
            config.pool.warning_threshold = parse_threshold("CUTOVER_POOL_WARNING_THRESHOLD", raw)?;
        }
        if let Some(raw) = envs.get("CUTOVER_POOL_CRITICAL_THRESHOLD") {
            config.pool.critical_threshold =
                parse_threshold("CUTOVER_POOL_CRITICAL_THRESHOLD", raw)?;
        }
        if let Some(raw) = envs.get("CUTOVER_POOL_EMERGENCY_THRESHOLD") {
            config.pool.emergency_threshold =
                parse_threshold("CUTOVER_POOL_EMERGENCY_THRESHOLD", raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.pool.max_connections == 0 {
            return Err("CUTOVER_DB_MAX_CONNECTIONS must be greater than 0".to_string());
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(format!(
                "CUTOVER_DB_MIN_CONNECTIONS ({}) cannot exceed CUTOVER_DB_MAX_CONNECTIONS ({})",
                self.pool.min_connections, self.pool.max_connections
            ));
        }
        if self.pool.critical_threshold <= self.pool.warning_threshold {
            return Err("pool critical threshold must be above the warning threshold".to_string());
        }
        if self.pool.emergency_threshold <= self.pool.critical_threshold {
            return Err("pool emergency threshold must be above the critical threshold".to_string());
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_u32(key: &str, raw: &str) -> Result<u32, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("invalid {key}='{raw}'"))
}

fn parse_threshold(key: &str, raw: &str) -> Result<u8, String> {
    let value: u8 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid {key}='{raw}'"))?;
    if value == 0 || value > 100 {
        return Err(format!("{key}={value} must be between 1 and 100"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_stay_on_legacy() {
        let config = CutoverConfig::from_env_map(&HashMap::new()).expect("defaults parse");
        assert_eq!(config.rollout_percentage, 0);
        assert!(!config.dual_write_enabled);
        assert!(!config.read_from_target);
        assert_eq!(config.pool.max_connections, 20);
    }

    #[test]
    fn parses_rollout_and_flags() {
        let envs = HashMap::from([
            ("CUTOVER_ROLLOUT_PERCENTAGE".to_string(), "25".to_string()),
            ("CUTOVER_DUAL_WRITE".to_string(), "true".to_string()),
            ("CUTOVER_READ_FROM_TARGET".to_string(), "on".to_string()),
        ]);
        let config = CutoverConfig::from_env_map(&envs).expect("parses");
        assert_eq!(config.rollout_percentage, 25);
        assert!(config.dual_write_enabled);
        assert!(config.read_from_target);
    }

    #[test]
    fn out_of_range_percentage_fails() {
        let envs = HashMap::from([(
            "CUTOVER_ROLLOUT_PERCENTAGE".to_string(),
            "150".to_string(),
        )]);
        let err = CutoverConfig::from_env_map(&envs).expect_err("must fail");
        assert!(err.contains("out of range"));
    }

    #[test]
    fn threshold_ordering_is_enforced() {
        let envs = HashMap::from([
            ("CUTOVER_POOL_WARNING_THRESHOLD".to_string(), "90".to_string()),
            ("CUTOVER_POOL_CRITICAL_THRESHOLD".to_string(), "80".to_string()),
        ]);
        let err = CutoverConfig::from_env_map(&envs).expect_err("must fail");
        assert!(err.contains("critical threshold"));
    }

    #[test]
    fn min_connections_cannot_exceed_max() {
        let envs = HashMap::from([
            ("CUTOVER_DB_MAX_CONNECTIONS".to_string(), "5".to_string()),
            ("CUTOVER_DB_MIN_CONNECTIONS".to_string(), "10".to_string()),
        ]);
        assert!(CutoverConfig::from_env_map(&envs).is_err());
    }
}
