//! A single cache tier with size accounting and pluggable eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::config::{EvictionPolicy, TierConfig};
use crate::error::{Error, Result};

/// One stored value plus the bookkeeping eviction needs
struct CacheEntry<V> {
    value: V,
    size: u64,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, size: u64, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            size,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }
}

struct TierState<V> {
    entries: FxHashMap<String, CacheEntry<V>>,
    current_size: u64,
    rng: ChaCha8Rng,
}

/// Counter snapshot for one tier
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub probes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
    pub current_size: u64,
    pub capacity: u64,
}

/// A bounded key/value store; capacity is measured in bytes
pub struct CacheTier<V> {
    capacity: AtomicU64,
    default_ttl: Duration,
    policy: EvictionPolicy,
    state: RwLock<TierState<V>>,
    probes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl<V: Clone> CacheTier<V> {
    pub fn new(config: &TierConfig, seed: u64) -> Result<Self> {
        if config.capacity_bytes == 0 {
            return Err(Error::Config("tier capacity must be > 0".into()));
        }
        Ok(Self {
            capacity: AtomicU64::new(config.capacity_bytes),
            default_ttl: config.ttl,
            policy: config.eviction,
            state: RwLock::new(TierState {
                entries: FxHashMap::default(),
                current_size: 0,
                rng: ChaCha8Rng::seed_from_u64(seed),
            }),
            probes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        })
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Look up a key, expiring it lazily if its TTL has passed
    pub fn get(&self, key: &str) -> Option<V> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write();
        let hit = match state.entries.get_mut(key) {
            Some(entry) if entry.is_expired() => None,
            Some(entry) => {
                entry.touch();
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        match hit {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                if let Some(entry) = state.entries.remove(key) {
                    state.current_size = state.current_size.saturating_sub(entry.size);
                }
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value, evicting per policy until it fits.
    ///
    /// Values larger than the whole tier are refused rather than flushing
    /// everything else out.
    pub fn insert(&self, key: &str, value: V, size: u64, ttl: Option<Duration>) -> bool {
        let capacity = self.capacity();
        if size > capacity {
            return false;
        }
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut state = self.state.write();

        if let Some(old) = state.entries.remove(key) {
            state.current_size = state.current_size.saturating_sub(old.size);
        }
        while state.current_size + size > capacity && !state.entries.is_empty() {
            self.evict_one(&mut state);
        }
        state.entries.insert(key.to_string(), CacheEntry::new(value, size, ttl));
        state.current_size += size;
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.remove(key) {
            state.current_size = state.current_size.saturating_sub(entry.size);
            true
        } else {
            false
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn clear_expired(&self) -> usize {
        let mut state = self.state.write();
        let dead: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dead {
            if let Some(entry) = state.entries.remove(key) {
                state.current_size = state.current_size.saturating_sub(entry.size);
            }
        }
        self.expired.fetch_add(dead.len() as u64, Ordering::Relaxed);
        dead.len()
    }

    /// Change the capacity, evicting down if the tier now overflows
    pub fn resize(&self, new_capacity: u64) {
        if new_capacity == 0 {
            return;
        }
        self.capacity.store(new_capacity, Ordering::Relaxed);
        let mut state = self.state.write();
        while state.current_size > new_capacity && !state.entries.is_empty() {
            self.evict_one(&mut state);
        }
    }

    pub fn stats(&self) -> TierStats {
        let state = self.state.read();
        TierStats {
            probes: self.probes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            entries: state.entries.len(),
            current_size: state.current_size,
            capacity: self.capacity(),
        }
    }

    fn evict_one(&self, state: &mut TierState<V>) {
        let victim = match self.policy {
            EvictionPolicy::Lru => state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.access_count)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Random => {
                let index = state.rng.gen_range(0..state.entries.len());
                state.entries.keys().nth(index).cloned()
            }
            EvictionPolicy::TtlFirst => state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.created_at + e.ttl)
                .map(|(k, _)| k.clone()),
        };
        if let Some(key) = victim {
            if let Some(entry) = state.entries.remove(&key) {
                state.current_size = state.current_size.saturating_sub(entry.size);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tier(capacity: u64, policy: EvictionPolicy) -> CacheTier<String> {
        CacheTier::new(
            &TierConfig {
                capacity_bytes: capacity,
                ttl: Duration::from_secs(60),
                eviction: policy,
            },
            7,
        )
        .unwrap()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = TierConfig {
            capacity_bytes: 0,
            ..TierConfig::default()
        };
        assert!(CacheTier::<String>::new(&config, 0).is_err());
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let tier = tier(30, EvictionPolicy::Lru);
        assert!(tier.insert("a", "x".into(), 10, None));
        assert!(tier.insert("b", "y".into(), 10, None));
        assert!(tier.insert("c", "z".into(), 10, None));
        // refresh a and c, so b is the LRU victim
        tier.get("a");
        tier.get("c");
        assert!(tier.insert("d", "w".into(), 10, None));
        assert!(tier.get("b").is_none());
        assert!(tier.get("a").is_some());
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn lfu_evicts_least_frequently_used() {
        let tier = tier(30, EvictionPolicy::Lfu);
        tier.insert("hot", "x".into(), 10, None);
        tier.insert("warm", "y".into(), 10, None);
        tier.insert("cold", "z".into(), 10, None);
        for _ in 0..5 {
            tier.get("hot");
        }
        tier.get("warm");
        tier.insert("new", "w".into(), 10, None);
        assert!(tier.get("cold").is_none());
        assert!(tier.get("hot").is_some());
    }

    #[test]
    fn ttl_first_evicts_earliest_deadline() {
        let tier = tier(30, EvictionPolicy::TtlFirst);
        tier.insert("short", "x".into(), 10, Some(Duration::from_secs(1)));
        tier.insert("long", "y".into(), 10, Some(Duration::from_secs(600)));
        tier.insert("mid", "z".into(), 10, Some(Duration::from_secs(60)));
        tier.insert("new", "w".into(), 10, None);
        assert!(tier.get("short").is_none());
        assert!(tier.get("long").is_some());
    }

    #[test]
    fn random_eviction_is_reproducible_for_a_seed() {
        let run = || {
            let tier = tier(30, EvictionPolicy::Random);
            for key in ["a", "b", "c"] {
                tier.insert(key, key.to_string(), 10, None);
            }
            tier.insert("d", "d".into(), 10, None);
            ["a", "b", "c"]
                .iter()
                .map(|k| tier.get(k).is_some())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn expired_entries_are_dropped_on_probe() {
        let tier = tier(100, EvictionPolicy::Lru);
        tier.insert("gone", "x".into(), 10, Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        assert!(tier.get("gone").is_none());
        let stats = tier.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.current_size, 0);
    }

    #[test]
    fn oversized_value_is_refused() {
        let tier = tier(10, EvictionPolicy::Lru);
        tier.insert("small", "x".into(), 5, None);
        assert!(!tier.insert("huge", "y".into(), 11, None));
        assert!(tier.get("small").is_some());
    }

    #[test]
    fn clear_expired_reclaims_size() {
        let tier = tier(100, EvictionPolicy::Lru);
        tier.insert("a", "x".into(), 10, Some(Duration::ZERO));
        tier.insert("b", "y".into(), 10, Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tier.clear_expired(), 1);
        let stats = tier.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.current_size, 10);
    }

    proptest! {
        #[test]
        fn current_size_never_exceeds_capacity(
            ops in proptest::collection::vec((0u8..16, 1u64..40), 1..200)
        ) {
            let tier = tier(100, EvictionPolicy::Lru);
            for (key, size) in ops {
                tier.insert(&format!("k{key}"), "v".into(), size, None);
                let stats = tier.stats();
                prop_assert!(stats.current_size <= stats.capacity);
            }
        }
    }
}
