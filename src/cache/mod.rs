//! Multi-level cache with promotion and predictive prefetch.
//!
//! Three tiers ordered fastest-to-slowest, probed in order. Writes go through
//! every enabled tier; a hit at a slow tier is copied into every faster tier
//! with that tier's own TTL. A background worker services prefetch requests
//! and a maintenance loop sweeps expired entries.

mod prefetch;
mod tier;

pub use prefetch::{PrefetchRequest, PrefetchStats, Prefetcher};
pub use tier::{CacheTier, TierStats};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

pub const TIER_COUNT: usize = 3;

/// Aggregated counter snapshot across tiers
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Lookups answered by any tier
    pub hits: u64,
    /// Lookups that missed every tier
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    pub expired: u64,
    /// Copies into faster tiers triggered by hits
    pub promotions: u64,
    /// Copies into the fastest tier performed by the prefetch worker
    pub prefetch_promotions: u64,
    pub total_size: u64,
    pub total_capacity: u64,
    pub prefetch: PrefetchStats,
    /// Per-tier snapshots; `None` marks a disabled tier
    pub tiers: Vec<Option<TierStats>>,
}

/// Narrow control surface the optimization engine drives the cache through
pub trait CacheControl: Send + Sync {
    fn stats(&self) -> CacheStats;
    fn clear_expired(&self) -> usize;
    /// Resize a tier (0-based); returns false if the tier is disabled
    fn resize_tier(&self, tier: usize, capacity_bytes: u64) -> bool;
    fn tier_capacity(&self, tier: usize) -> Option<u64>;
    fn prefetch_threshold(&self) -> f64;
    fn set_prefetch_threshold(&self, threshold: f64);
}

/// Three-tier cache front end
pub struct MultiLevelCache<V> {
    tiers: [Option<Arc<CacheTier<V>>>; TIER_COUNT],
    prefetcher: Arc<Prefetcher>,
    prefetch_rx: Mutex<Option<mpsc::Receiver<PrefetchRequest>>>,
    maintenance_interval: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    prefetch_promotions: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<V> MultiLevelCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Build the cache from configuration.
    ///
    /// A tier that fails validation is disabled with a warning rather than
    /// failing the whole cache.
    pub fn new(config: &CacheConfig) -> Self {
        let mut tiers: [Option<Arc<CacheTier<V>>>; TIER_COUNT] = [None, None, None];
        for (index, slot) in tiers.iter_mut().enumerate() {
            match CacheTier::new(config.tier(index), config.eviction_seed ^ index as u64) {
                Ok(tier) => *slot = Some(Arc::new(tier)),
                Err(e) => {
                    warn!(tier = index + 1, error = %e, "cache tier disabled");
                }
            }
        }
        let (prefetcher, prefetch_rx) = Prefetcher::new(&config.prefetch);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tiers,
            prefetcher: Arc::new(prefetcher),
            prefetch_rx: Mutex::new(Some(prefetch_rx)),
            maintenance_interval: config.maintenance_interval,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            prefetch_promotions: AtomicU64::new(0),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Probe tiers fastest-first; a hit at a slower tier is promoted into
    /// every faster tier before returning
    pub fn get(&self, key: &str) -> Option<V> {
        for (index, slot) in self.tiers.iter().enumerate() {
            let tier = match slot {
                Some(tier) => tier,
                None => continue,
            };
            if let Some(value) = tier.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if index > 0 {
                    self.promote(key, &value, index);
                }
                self.prefetcher.record_access(key, index + 1);
                return Some(value);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write-through set across every enabled tier.
    ///
    /// `ttl` of `None` uses each tier's default lifetime.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let size = Self::measure(&value);
        for tier in self.tiers.iter().flatten() {
            tier.insert(key, value.clone(), size, ttl);
        }
    }

    /// Remove a key from every tier; true if any tier held it
    pub fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        for tier in self.tiers.iter().flatten() {
            removed |= tier.remove(key);
        }
        removed
    }

    /// Sweep expired entries in every tier, returning the total removed
    pub fn clear_expired(&self) -> usize {
        self.tiers
            .iter()
            .flatten()
            .map(|tier| tier.clear_expired())
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        let tiers: Vec<Option<TierStats>> = self
            .tiers
            .iter()
            .map(|slot| slot.as_ref().map(|tier| tier.stats()))
            .collect();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_ratio = if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        };
        let evictions = tiers.iter().flatten().map(|t| t.evictions).sum();
        let expired = tiers.iter().flatten().map(|t| t.expired).sum();
        let total_size = tiers.iter().flatten().map(|t| t.current_size).sum();
        let total_capacity = tiers.iter().flatten().map(|t| t.capacity).sum();
        CacheStats {
            hits,
            misses,
            hit_ratio,
            evictions,
            expired,
            promotions: self.promotions.load(Ordering::Relaxed),
            prefetch_promotions: self.prefetch_promotions.load(Ordering::Relaxed),
            total_size,
            total_capacity,
            prefetch: self.prefetcher.stats(),
            tiers,
        }
    }

    /// Spawn the prefetch worker and the expired-entry sweeper
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        if let Some(mut rx) = self.prefetch_rx.lock().take() {
            let cache = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        request = rx.recv() => {
                            match request {
                                Some(request) => cache.service_prefetch(&request),
                                None => break,
                            }
                        }
                        result = shutdown.changed() => {
                            if result.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("prefetch worker stopped");
            }));
        }

        let cache = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.maintenance_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.clear_expired();
                        if removed > 0 {
                            debug!(removed, "cache maintenance swept expired entries");
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cache maintenance stopped");
        }));

        info!("multi-level cache started");
    }

    /// Stop background work and wait for it to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;
        info!("multi-level cache stopped");
    }

    fn promote(&self, key: &str, value: &V, found_at: usize) {
        let size = Self::measure(value);
        for faster in self.tiers.iter().take(found_at).flatten() {
            tier_insert_default(faster, key, value.clone(), size);
        }
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    fn service_prefetch(&self, request: &PrefetchRequest) {
        let front = match &self.tiers[0] {
            Some(tier) => tier,
            None => return,
        };
        if front.get(&request.key).is_some() {
            self.prefetcher.mark_completed();
            return;
        }
        // the tier the hit came from is the likeliest holder; fall back to
        // the other slow tiers if the key has moved since
        let source = request.source_tier.saturating_sub(1);
        let candidates =
            std::iter::once(source).chain((1..TIER_COUNT).filter(|&index| index != source));
        for index in candidates {
            let tier = match self.tiers.get(index).and_then(|slot| slot.as_ref()) {
                Some(tier) => tier,
                None => continue,
            };
            if let Some(value) = tier.get(&request.key) {
                let size = Self::measure(&value);
                tier_insert_default(front, &request.key, value, size);
                self.prefetch_promotions.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.prefetcher.mark_completed();
    }

    /// Approximate the serialized footprint of a value
    fn measure(value: &V) -> u64 {
        bincode::serialized_size(value).unwrap_or(std::mem::size_of::<V>() as u64)
    }
}

fn tier_insert_default<V: Clone>(tier: &CacheTier<V>, key: &str, value: V, size: u64) {
    tier.insert(key, value, size, Some(tier.default_ttl()));
}

impl<V> CacheControl for MultiLevelCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn stats(&self) -> CacheStats {
        MultiLevelCache::stats(self)
    }

    fn clear_expired(&self) -> usize {
        MultiLevelCache::clear_expired(self)
    }

    fn resize_tier(&self, tier: usize, capacity_bytes: u64) -> bool {
        match self.tiers.get(tier).and_then(|slot| slot.as_ref()) {
            Some(tier) => {
                tier.resize(capacity_bytes);
                true
            }
            None => false,
        }
    }

    fn tier_capacity(&self, tier: usize) -> Option<u64> {
        self.tiers
            .get(tier)
            .and_then(|slot| slot.as_ref())
            .map(|tier| tier.capacity())
    }

    fn prefetch_threshold(&self) -> f64 {
        self.prefetcher.threshold()
    }

    fn set_prefetch_threshold(&self, threshold: f64) {
        self.prefetcher.set_threshold(threshold);
    }
}
