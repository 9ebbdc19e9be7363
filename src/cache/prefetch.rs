//! Access-pattern tracking and prefetch scheduling.
//!
//! Each cache hit is recorded against a bounded pattern table. Keys whose
//! access frequency inside the sliding window crosses the threshold are
//! queued for promotion into the fastest tier; a full queue drops the
//! request rather than stalling the read path.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::PrefetchConfig;

/// Per-key access history inside the sliding window
pub struct AccessPattern {
    timestamps: VecDeque<Instant>,
    /// Accesses per second over the retained window
    pub frequency: f64,
    /// Projected time of the next access, from the mean inter-access gap
    pub predicted_next: Option<Instant>,
    /// No re-queue before this point; set from the prediction on queue
    next_queue_at: Option<Instant>,
}

impl AccessPattern {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
            frequency: 0.0,
            predicted_next: None,
            next_queue_at: None,
        }
    }

    fn record(&mut self, now: Instant, window: Duration) {
        self.timestamps.push_back(now);
        while let Some(first) = self.timestamps.front() {
            if now.duration_since(*first) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        let count = self.timestamps.len();
        if count < 2 {
            self.frequency = count as f64;
            self.predicted_next = None;
            return;
        }
        let span = now
            .duration_since(self.timestamps[0])
            .as_secs_f64()
            .max(f64::EPSILON);
        self.frequency = count as f64 / span;
        let mean_gap = span / (count - 1) as f64;
        self.predicted_next = Some(now + Duration::from_secs_f64(mean_gap));
    }
}

/// Work item for the prefetch worker: copy `key` from `source_tier` forward
#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub key: String,
    pub source_tier: usize,
}

/// Counter snapshot for the prefetcher
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrefetchStats {
    pub tracked_keys: usize,
    pub queued: u64,
    pub dropped: u64,
    pub completed: u64,
}

/// Sliding-window frequency tracker feeding the prefetch queue
pub struct Prefetcher {
    window: Duration,
    threshold_bits: AtomicU64,
    patterns: Mutex<LruCache<String, AccessPattern>>,
    queue: mpsc::Sender<PrefetchRequest>,
    queued: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
}

impl Prefetcher {
    pub fn new(config: &PrefetchConfig) -> (Self, mpsc::Receiver<PrefetchRequest>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let capacity =
            NonZeroUsize::new(config.pattern_capacity).unwrap_or(NonZeroUsize::MIN);
        let prefetcher = Self {
            window: config.window,
            threshold_bits: AtomicU64::new(config.threshold.to_bits()),
            patterns: Mutex::new(LruCache::new(capacity)),
            queue: tx,
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        };
        (prefetcher, rx)
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&self, threshold: f64) {
        self.threshold_bits
            .store(threshold.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Record a hit at `tier` (1-based). Hits at slower tiers whose frequency
    /// crosses the threshold are queued for promotion, at most once per
    /// predicted access.
    pub fn record_access(&self, key: &str, tier: usize) {
        let now = Instant::now();
        let mut patterns = self.patterns.lock();
        if !patterns.contains(key) {
            patterns.put(key.to_string(), AccessPattern::new());
        }
        let pattern = match patterns.get_mut(key) {
            Some(pattern) => pattern,
            None => return,
        };
        pattern.record(now, self.window);

        if tier <= 1 || pattern.frequency < self.threshold() {
            return;
        }
        // a queued copy should land before the predicted next access;
        // until then another request buys nothing
        if pattern.next_queue_at.is_some_and(|at| now < at) {
            return;
        }
        let request = PrefetchRequest {
            key: key.to_string(),
            source_tier: tier,
        };
        match self.queue.try_send(request) {
            Ok(()) => {
                pattern.next_queue_at = pattern.predicted_next;
                self.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(key, "prefetch queue full, dropping request");
            }
        }
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PrefetchStats {
        PrefetchStats {
            tracked_keys: self.patterns.lock().len(),
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(queue_capacity: usize) -> PrefetchConfig {
        PrefetchConfig {
            threshold: 0.5,
            window: Duration::from_secs(300),
            queue_capacity,
            pattern_capacity: 64,
        }
    }

    #[test]
    fn frequent_slow_tier_hits_are_queued() {
        let (prefetcher, mut rx) = Prefetcher::new(&config(10));
        for _ in 0..5 {
            prefetcher.record_access("hot", 3);
        }
        let request = rx.try_recv().expect("expected a prefetch request");
        assert_eq!(request.key, "hot");
        assert_eq!(request.source_tier, 3);
        assert!(prefetcher.stats().queued >= 1);
    }

    #[test]
    fn fastest_tier_hits_are_never_queued() {
        let (prefetcher, mut rx) = Prefetcher::new(&config(10));
        for _ in 0..10 {
            prefetcher.record_access("hot", 1);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(prefetcher.stats().queued, 0);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (prefetcher, _rx) = Prefetcher::new(&config(1));
        for _ in 0..20 {
            prefetcher.record_access("hot", 2);
        }
        let stats = prefetcher.stats();
        assert_eq!(stats.queued, 1);
        assert!(stats.dropped > 0);
    }

    #[test]
    fn requeue_waits_for_the_predicted_access() {
        let (prefetcher, mut rx) = Prefetcher::new(&config(10));
        prefetcher.record_access("hot", 2); // queued, no prediction yet
        std::thread::sleep(Duration::from_millis(20));
        prefetcher.record_access("hot", 2); // queued, prediction ~20ms out
        prefetcher.record_access("hot", 2); // inside the predicted gap, skipped

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        let stats = prefetcher.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn single_access_predicts_nothing() {
        let (prefetcher, _rx) = Prefetcher::new(&config(10));
        prefetcher.record_access("once", 2);
        let patterns = prefetcher.patterns.lock();
        let pattern = patterns.peek("once").unwrap();
        assert!(pattern.predicted_next.is_none());
        assert_eq!(pattern.frequency, 1.0);
    }

    #[test]
    fn pattern_table_is_bounded() {
        let (prefetcher, _rx) = Prefetcher::new(&config(10));
        for i in 0..200 {
            prefetcher.record_access(&format!("k{i}"), 1);
        }
        assert!(prefetcher.stats().tracked_keys <= 64);
    }
}
