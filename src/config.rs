//! Configuration for the performance-optimization core.
//!
//! Every section deserializes from TOML with per-field fallbacks, so a partial
//! file (or an empty one) yields working defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration covering all subsystems
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub tuner: TunerConfig,
    pub profiler: ProfilerConfig,
}

impl PerfConfig {
    /// Parse a configuration from a TOML string
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: PerfConfig =
            toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.engine.queue_capacity == 0 {
            return Err(Error::Config("engine.queue_capacity must be > 0".into()));
        }
        if self.pool.max_connections == 0 {
            return Err(Error::Config("pool.max_connections must be > 0".into()));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(Error::Config(
                "pool.min_connections must not exceed pool.max_connections".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.engine.cpu_threshold)
            || !(0.0..=1.0).contains(&self.engine.memory_threshold)
        {
            return Err(Error::Config(
                "engine thresholds must lie in [0.0, 1.0]".into(),
            ));
        }
        if self.tuner.learning_rate <= 0.0 {
            return Err(Error::Config("tuner.learning_rate must be > 0".into()));
        }
        if self.profiler.high_ratio < 1.0 || self.profiler.critical_ratio < self.profiler.high_ratio
        {
            return Err(Error::Config(
                "profiler severity ratios must satisfy 1.0 <= high <= critical".into(),
            ));
        }
        Ok(())
    }
}

/// Optimization engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master switch; a disabled engine rejects all requests
    pub enabled: bool,
    /// Cadence of the resource monitor loop
    #[serde(with = "humantime_serde")]
    pub optimization_interval: Duration,
    /// Bound of the pending-request queue
    pub queue_capacity: usize,
    /// CPU usage ratio above which a Cpu optimization is synthesized
    pub cpu_threshold: f64,
    /// Memory usage ratio above which a Memory optimization is synthesized
    pub memory_threshold: f64,
    /// Worker count above which a Resource optimization is synthesized
    pub max_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            optimization_interval: Duration::from_secs(300),
            queue_capacity: 1000,
            cpu_threshold: 0.8,
            memory_threshold: 0.85,
            max_workers: num_cpus::get().saturating_mul(1024),
        }
    }
}

/// Eviction policy for one cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Random,
    TtlFirst,
}

/// Settings for one cache tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Capacity in bytes; zero disables the tier
    pub capacity_bytes: u64,
    /// Default lifetime for entries stored at this tier
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub eviction: EvictionPolicy,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 100 * 1024 * 1024,
            ttl: Duration::from_secs(3600),
            eviction: EvictionPolicy::Lru,
        }
    }
}

/// Multi-level cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub tier1: TierConfig,
    pub tier2: TierConfig,
    pub tier3: TierConfig,
    /// Cadence of the expired-entry sweep
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    /// Seed for the random eviction policy, for reproducible runs
    pub eviction_seed: u64,
    pub prefetch: PrefetchConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tier1: TierConfig::default(),
            tier2: TierConfig {
                capacity_bytes: 1024 * 1024 * 1024,
                ttl: Duration::from_secs(24 * 3600),
                eviction: EvictionPolicy::Lru,
            },
            tier3: TierConfig {
                capacity_bytes: 10 * 1024 * 1024 * 1024,
                ttl: Duration::from_secs(7 * 24 * 3600),
                eviction: EvictionPolicy::Lru,
            },
            maintenance_interval: Duration::from_secs(300),
            eviction_seed: 0,
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn tier(&self, index: usize) -> &TierConfig {
        match index {
            0 => &self.tier1,
            1 => &self.tier2,
            _ => &self.tier3,
        }
    }
}

/// Access-pattern prefetcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Minimum accesses-per-second before a key is scheduled for prefetch
    pub threshold: f64,
    /// Sliding window over which access frequency is computed
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Bound of the prefetch work queue; overflow drops the request
    pub queue_capacity: usize,
    /// Number of distinct keys tracked; least-recent patterns fall off
    pub pattern_capacity: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            window: Duration::from_secs(300),
            queue_capacity: 100,
            pattern_capacity: 4096,
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard ceiling on live connections
    pub max_connections: usize,
    /// Connections opened eagerly at startup
    pub min_connections: usize,
    /// How long an acquire blocks before giving up
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Idle connections older than this are reaped
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// A released connection older than `idle_retention * idle_timeout`
    /// is destroyed instead of parked
    pub idle_retention: u32,
    /// Cadence of the idle reaper
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            min_connections: 25,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            idle_retention: 10,
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

/// Search strategy used by the auto-tuner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunerStrategyKind {
    HillClimb,
    RandomSearch,
}

/// Auto-tuner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Cadence of the background tuning loop
    #[serde(with = "humantime_serde")]
    pub tuning_interval: Duration,
    /// Scales the step applied per iteration
    pub learning_rate: f64,
    /// Probability of a randomized step direction per parameter
    pub exploration_rate: f64,
    /// Objective deltas below this magnitude count toward convergence
    pub convergence_threshold: f64,
    /// Maximum retained tuning-history entries
    pub history_retention: usize,
    pub strategy: TunerStrategyKind,
    /// Desired steady-state CPU usage ratio
    pub target_cpu: f64,
    /// Desired steady-state memory usage ratio
    pub target_memory: f64,
    pub cpu_weight: f64,
    pub memory_weight: f64,
    /// Seed for exploration and random search, for reproducible runs
    pub seed: u64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            tuning_interval: Duration::from_secs(600),
            learning_rate: 0.1,
            exploration_rate: 0.1,
            convergence_threshold: 0.01,
            history_retention: 1000,
            strategy: TunerStrategyKind::HillClimb,
            target_cpu: 0.7,
            target_memory: 0.8,
            cpu_weight: 0.4,
            memory_weight: 0.6,
            seed: 0,
        }
    }
}

/// Profiler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Cadence of the bottleneck detection loop
    #[serde(with = "humantime_serde")]
    pub detection_interval: Duration,
    /// Cadence of the trend analysis loop
    #[serde(with = "humantime_serde")]
    pub trend_interval: Duration,
    /// Samples older than this are pruned from each group
    #[serde(with = "humantime_serde")]
    pub detection_window: Duration,
    /// Minimum samples in a group before it is considered at all
    pub min_sample_size: usize,
    /// mean/threshold ratio at which a bottleneck is High
    pub high_ratio: f64,
    /// mean/threshold ratio at which a bottleneck is Critical
    pub critical_ratio: f64,
    /// Regression slopes within +/- epsilon classify as stable
    pub slope_epsilon: f64,
    /// Values kept per group for trend regression
    pub trend_buffer_size: usize,
    /// Per-metric thresholds; metrics without an entry are never bottlenecks
    pub thresholds: HashMap<String, f64>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        let mut thresholds = HashMap::new();
        thresholds.insert("cpu_usage".to_string(), 0.8);
        thresholds.insert("memory_usage".to_string(), 0.85);
        thresholds.insert("utilization".to_string(), 0.9);
        Self {
            detection_interval: Duration::from_secs(60),
            trend_interval: Duration::from_secs(150),
            detection_window: Duration::from_secs(300),
            min_sample_size: 10,
            high_ratio: 1.5,
            critical_ratio: 2.0,
            slope_epsilon: 0.01,
            trend_buffer_size: 100,
            thresholds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = PerfConfig::from_toml_str("").unwrap();
        assert!(config.engine.enabled);
        assert_eq!(config.engine.queue_capacity, 1000);
        assert_eq!(config.cache.tier1.capacity_bytes, 100 * 1024 * 1024);
        assert_eq!(config.cache.tier3.ttl, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.pool.max_connections, 100);
        assert_eq!(config.tuner.strategy, TunerStrategyKind::HillClimb);
        assert_eq!(config.profiler.min_sample_size, 10);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let raw = r#"
            [engine]
            queue_capacity = 64
            optimization_interval = "10s"

            [cache.tier1]
            capacity_bytes = 4096
            eviction = "lfu"

            [pool]
            max_connections = 8
            min_connections = 2
        "#;
        let config = PerfConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.engine.queue_capacity, 64);
        assert_eq!(config.engine.optimization_interval, Duration::from_secs(10));
        assert!(config.engine.enabled);
        assert_eq!(config.cache.tier1.capacity_bytes, 4096);
        assert_eq!(config.cache.tier1.eviction, EvictionPolicy::Lfu);
        assert_eq!(config.cache.tier2.capacity_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.pool.min_connections, 2);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let raw = r#"
            [pool]
            max_connections = 2
            min_connections = 10
        "#;
        assert!(matches!(
            PerfConfig::from_toml_str(raw),
            Err(Error::Config(_))
        ));

        let raw = r#"
            [engine]
            cpu_threshold = 1.5
        "#;
        assert!(matches!(
            PerfConfig::from_toml_str(raw),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tuner]\nlearning_rate = 0.25").unwrap();
        let config = PerfConfig::from_path(file.path()).unwrap();
        assert_eq!(config.tuner.learning_rate, 0.25);
    }
}
