/// Configuration management for the Mechaway execution core
///
/// Handles context store thresholds, resolution cache tuning, run pool eviction and
/// platform policy layers. Every value can be overridden from `MECHAWAY_*` env vars.

use crate::runtime::policy::PlatformPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Run context store / RefValue factory configuration
    pub context: ContextConfig,
    /// Resolution cache configuration
    pub cache: CacheConfig,
    /// Run pool configuration
    pub pool: PoolConfig,
    /// Platform defaults and ceilings for node policies
    pub policy: PlatformPolicy,
    /// Engine loop configuration
    pub engine: EngineConfig,
}

/// Thresholds used by the RefValue factory when picking a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Payloads estimated below this size stay in memory (default 1 MiB)
    pub memory_threshold: u64,
    /// JSON payloads up to this size are kept as parsed trees (default 2 MiB)
    pub json_threshold: u64,
    /// Decoded base64 payloads above this size are spooled to disk (default 512 KiB)
    pub base64_threshold: u64,
    /// Directory for spooled temp files
    pub spool_dir: PathBuf,
    /// Temp file name prefix, combined with the process id
    pub spool_prefix: String,
}

/// Resolution cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Templates with more live consumers than this are always cached
    pub hot_consumer_threshold: i64,
    /// Minimum consumers for cost-based admission
    pub min_consumers: i64,
    /// Average resolution cost (ms) that makes a template worth caching
    pub expensive_cost_ms: f64,
    /// EMA smoothing factor
    pub ema_alpha: f64,
    /// TTL = EMA cost × multiplier
    pub ttl_multiplier: f64,
    pub ttl_floor: Duration,
    pub ttl_ceiling: Duration,
    /// Memory usage ratio at which TTLs collapse to the floor
    pub memory_pressure_threshold: f64,
    /// LRU cap per run partition (0 disables)
    pub max_entries_per_run: usize,
}

/// Run-keyed context pool eviction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle runs older than this are reclaimed
    pub idle_ttl: Duration,
    /// Upper bound on live run stores (0 disables)
    pub max_runs: usize,
    /// Background sweep interval
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard limit on node dispatches per invocation
    pub max_steps: usize,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl Default for ContextConfig {
    /// Default thresholds with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            memory_threshold: env_or("MECHAWAY_MEMORY_THRESHOLD", 1024 * 1024),
            json_threshold: env_or("MECHAWAY_JSON_THRESHOLD", 2 * 1024 * 1024),
            base64_threshold: env_or("MECHAWAY_BASE64_THRESHOLD", 512 * 1024),
            spool_dir: std::env::var("MECHAWAY_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            spool_prefix: std::env::var("MECHAWAY_SPOOL_PREFIX")
                .unwrap_or_else(|_| "mechaway".to_string()),
        }
    }
}

impl ContextConfig {
    /// Same thresholds, different spool directory (tests, per-tenant dirs)
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = dir.into();
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_consumer_threshold: 5,
            min_consumers: 2,
            expensive_cost_ms: 10.0,
            ema_alpha: 0.2,
            ttl_multiplier: 20.0,
            ttl_floor: Duration::from_secs(1),
            ttl_ceiling: Duration::from_secs(15 * 60),
            memory_pressure_threshold: 0.90,
            max_entries_per_run: env_or("MECHAWAY_CACHE_MAX_ENTRIES", 10_000),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(env_or("MECHAWAY_RUN_IDLE_SECS", 30 * 60)),
            max_runs: env_or("MECHAWAY_MAX_RUNS", 1024),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: env_or("MECHAWAY_MAX_STEPS", 10_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_match_documented_values() {
        let cfg = ContextConfig {
            spool_dir: PathBuf::from("/tmp"),
            ..ContextConfig::default()
        };
        // env overrides are not set in the test environment
        if std::env::var("MECHAWAY_MEMORY_THRESHOLD").is_err() {
            assert_eq!(cfg.memory_threshold, 1024 * 1024);
        }
        if std::env::var("MECHAWAY_JSON_THRESHOLD").is_err() {
            assert_eq!(cfg.json_threshold, 2 * 1024 * 1024);
        }
        let cache = CacheConfig::default();
        assert_eq!(cache.ttl_floor, Duration::from_secs(1));
        assert_eq!(cache.ttl_ceiling, Duration::from_secs(900));
    }
}
