//! Built-in optimization passes and the extension hook for custom ones.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::request::{OptimizationChange, OptimizationRequest};
use crate::cache::CacheControl;
use crate::error::Result;
use crate::pool::PoolControl;

/// Extension point for algorithm, latency and throughput requests.
///
/// Returns the measured improvement and the changes applied.
#[async_trait]
pub trait StrategyHook: Send + Sync {
    async fn optimize(
        &self,
        request: &OptimizationRequest,
    ) -> Result<(f64, Vec<OptimizationChange>)>;
}

/// Cache pass: sweep expired entries, grow the fast tier when the hit ratio
/// sags, loosen the prefetch threshold when prefetch never fires
pub struct CacheOptimizer {
    /// Fast-tier growth per pass when the hit ratio is below target
    growth_factor: f64,
    hit_ratio_target: f64,
    prefetch_floor: f64,
}

impl Default for CacheOptimizer {
    fn default() -> Self {
        Self {
            growth_factor: 1.25,
            hit_ratio_target: 0.8,
            prefetch_floor: 0.1,
        }
    }
}

impl CacheOptimizer {
    pub fn optimize(&self, cache: &dyn CacheControl) -> (f64, Vec<OptimizationChange>) {
        let before = Self::score(cache);
        let mut changes = Vec::new();

        let swept = cache.clear_expired();
        if swept > 0 {
            changes.push(OptimizationChange {
                component: "cache".into(),
                parameter: "expired_entries".into(),
                old_value: json!(swept),
                new_value: json!(0),
                reversible: false,
            });
        }

        let stats = cache.stats();
        let lookups = stats.hits + stats.misses;
        if lookups > 0 && stats.hit_ratio < self.hit_ratio_target {
            if let Some(capacity) = cache.tier_capacity(0) {
                let grown = (capacity as f64 * self.growth_factor) as u64;
                if cache.resize_tier(0, grown) {
                    changes.push(OptimizationChange {
                        component: "cache".into(),
                        parameter: "tier1_capacity_bytes".into(),
                        old_value: json!(capacity),
                        new_value: json!(grown),
                        reversible: true,
                    });
                }
            }
            let threshold = cache.prefetch_threshold();
            let loosened = (threshold * 0.9).max(self.prefetch_floor);
            if loosened < threshold {
                cache.set_prefetch_threshold(loosened);
                changes.push(OptimizationChange {
                    component: "cache".into(),
                    parameter: "prefetch_threshold".into(),
                    old_value: json!(threshold),
                    new_value: json!(loosened),
                    reversible: true,
                });
            }
        }

        let improvement = Self::score(cache) - before;
        debug!(improvement, changes = changes.len(), "cache pass finished");
        (improvement, changes)
    }

    /// Composite score: mostly hit ratio, partly capacity headroom
    fn score(cache: &dyn CacheControl) -> f64 {
        let stats = cache.stats();
        let headroom = if stats.total_capacity > 0 {
            1.0 - stats.total_size as f64 / stats.total_capacity as f64
        } else {
            0.0
        };
        stats.hit_ratio * 70.0 + headroom * 30.0
    }
}

/// Pool pass: move the connection ceiling toward a utilization target
pub struct PoolOptimizer {
    utilization_target: f64,
    /// Ceiling multiplier per growth step
    growth_factor: f64,
    min_ceiling: usize,
    max_ceiling: usize,
}

impl Default for PoolOptimizer {
    fn default() -> Self {
        Self {
            utilization_target: 0.75,
            growth_factor: 1.25,
            min_ceiling: 1,
            max_ceiling: 10_000,
        }
    }
}

impl PoolOptimizer {
    pub fn optimize(&self, pool: &dyn PoolControl) -> (f64, Vec<OptimizationChange>) {
        let stats = pool.stats();
        let before = (stats.utilization - self.utilization_target).abs();
        let mut changes = Vec::new();

        let max = pool.max_connections();
        if stats.utilization > self.utilization_target + 0.1 {
            let grown = ((max as f64 * self.growth_factor).ceil() as usize)
                .clamp(self.min_ceiling, self.max_ceiling);
            if grown != max {
                pool.scale(grown);
                changes.push(OptimizationChange {
                    component: "pool".into(),
                    parameter: "max_connections".into(),
                    old_value: json!(max),
                    new_value: json!(grown),
                    reversible: true,
                });
            }
        } else if stats.utilization < self.utilization_target - 0.25 && stats.idle > 0 {
            let shrunk = ((max as f64 / self.growth_factor).floor() as usize)
                .clamp(self.min_ceiling, self.max_ceiling)
                .max(stats.active);
            if shrunk < max {
                pool.scale(shrunk);
                changes.push(OptimizationChange {
                    component: "pool".into(),
                    parameter: "max_connections".into(),
                    old_value: json!(max),
                    new_value: json!(shrunk),
                    reversible: true,
                });
            }
        }

        let after = (pool.stats().utilization - self.utilization_target).abs();
        let improvement = (before - after) * 100.0;
        debug!(improvement, changes = changes.len(), "pool pass finished");
        (improvement, changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStats, PrefetchStats};
    use crate::pool::PoolStats;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeCache {
        stats: Mutex<CacheStats>,
        tier1_capacity: AtomicUsize,
        threshold: Mutex<f64>,
    }

    impl FakeCache {
        fn with_hit_ratio(hit_ratio: f64) -> Self {
            Self {
                stats: Mutex::new(CacheStats {
                    hits: (hit_ratio * 100.0) as u64,
                    misses: 100 - (hit_ratio * 100.0) as u64,
                    hit_ratio,
                    total_size: 500,
                    total_capacity: 1000,
                    prefetch: PrefetchStats::default(),
                    ..CacheStats::default()
                }),
                tier1_capacity: AtomicUsize::new(1000),
                threshold: Mutex::new(0.7),
            }
        }
    }

    impl CacheControl for FakeCache {
        fn stats(&self) -> CacheStats {
            self.stats.lock().clone()
        }

        fn clear_expired(&self) -> usize {
            3
        }

        fn resize_tier(&self, tier: usize, capacity_bytes: u64) -> bool {
            if tier == 0 {
                self.tier1_capacity
                    .store(capacity_bytes as usize, Ordering::SeqCst);
                self.stats.lock().total_capacity = capacity_bytes;
                true
            } else {
                false
            }
        }

        fn tier_capacity(&self, tier: usize) -> Option<u64> {
            (tier == 0).then(|| self.tier1_capacity.load(Ordering::SeqCst) as u64)
        }

        fn prefetch_threshold(&self) -> f64 {
            *self.threshold.lock()
        }

        fn set_prefetch_threshold(&self, threshold: f64) {
            *self.threshold.lock() = threshold;
        }
    }

    #[test]
    fn low_hit_ratio_grows_fast_tier_and_loosens_prefetch() {
        let cache = FakeCache::with_hit_ratio(0.4);
        let (improvement, changes) = CacheOptimizer::default().optimize(&cache);
        assert_eq!(cache.tier1_capacity.load(Ordering::SeqCst), 1250);
        assert!(*cache.threshold.lock() < 0.7);
        assert!(improvement > 0.0); // capacity grew, headroom improved
        assert!(changes.iter().any(|c| c.parameter == "tier1_capacity_bytes"));
        assert!(changes.iter().any(|c| c.parameter == "prefetch_threshold"));
    }

    #[test]
    fn healthy_hit_ratio_leaves_capacity_alone() {
        let cache = FakeCache::with_hit_ratio(0.95);
        let (_, changes) = CacheOptimizer::default().optimize(&cache);
        assert_eq!(cache.tier1_capacity.load(Ordering::SeqCst), 1000);
        assert!(!changes.iter().any(|c| c.parameter == "tier1_capacity_bytes"));
    }

    struct FakePool {
        max: AtomicUsize,
        active: usize,
        idle: usize,
    }

    impl PoolControl for FakePool {
        fn stats(&self) -> PoolStats {
            let max = self.max.load(Ordering::SeqCst);
            PoolStats {
                active: self.active,
                idle: self.idle,
                total: self.active + self.idle,
                max,
                utilization: if max > 0 {
                    self.active as f64 / max as f64
                } else {
                    0.0
                },
                ..PoolStats::default()
            }
        }

        fn scale(&self, new_max: usize) {
            self.max.store(new_max, Ordering::SeqCst);
        }

        fn max_connections(&self) -> usize {
            self.max.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn hot_pool_is_grown() {
        let pool = FakePool {
            max: AtomicUsize::new(10),
            active: 10,
            idle: 0,
        };
        let (improvement, changes) = PoolOptimizer::default().optimize(&pool);
        assert_eq!(pool.max.load(Ordering::SeqCst), 13);
        assert_eq!(changes.len(), 1);
        assert!(improvement > 0.0);
    }

    #[test]
    fn idle_pool_is_shrunk() {
        let pool = FakePool {
            max: AtomicUsize::new(100),
            active: 10,
            idle: 40,
        };
        let (_, changes) = PoolOptimizer::default().optimize(&pool);
        assert!(pool.max.load(Ordering::SeqCst) < 100);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn on_target_pool_is_untouched() {
        let pool = FakePool {
            max: AtomicUsize::new(100),
            active: 75,
            idle: 5,
        };
        let (improvement, changes) = PoolOptimizer::default().optimize(&pool);
        assert_eq!(pool.max.load(Ordering::SeqCst), 100);
        assert!(changes.is_empty());
        assert_eq!(improvement, 0.0);
    }
}
