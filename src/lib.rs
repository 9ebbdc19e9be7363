//! perfcore - an in-process adaptive performance-optimization core
//!
//! The crate is organized around one orchestrator and four subsystems:
//! - engine: bounded request queue, consumer loop, resource monitor
//! - cache: three-tier cache with promotion and predictive prefetch
//! - pool: bounded, validated connection pool
//! - tuner: closed-loop parameter search against a measurable objective
//! - profiler: passive bottleneck detection and trend analysis
//!
//! The engine owns the tuner and profiler and reaches the cache and pool
//! through the `CacheControl` and `PoolControl` traits, so applications can
//! wire in their own implementations or use the ones provided here.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod profiler;
pub mod tuner;

pub use cache::{CacheControl, CacheStats, MultiLevelCache};
pub use config::PerfConfig;
pub use engine::{
    OptimizationEngine, OptimizationKind, OptimizationMetrics, OptimizationRequest, Priority,
    StrategyHook,
};
pub use error::{Error, Result};
pub use metrics::{MetricsSource, RuntimeMetrics, SystemMetricsSource};
pub use pool::{ConnectionFactory, ConnectionPool, PoolControl, PoolStats, PooledConnection};
pub use profiler::{Profiler, ProfilingReport};
pub use tuner::{AutoTuner, ParameterValue, TunableParameter};
