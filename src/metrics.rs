//! Runtime metrics sampling.
//!
//! Every consumer of system load goes through [`MetricsSource`], so tests can
//! substitute a fixed reading and the tuner can measure its objective without
//! touching the OS directly.

use serde::{Deserialize, Serialize};
use sysinfo::{CpuExt, System, SystemExt};

/// One point-in-time reading of process-visible load
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    /// Global CPU usage as a ratio in [0, 1]
    pub cpu_usage: f64,
    /// Used physical memory as a ratio of total in [0, 1]
    pub memory_usage: f64,
    /// Concurrency proxy: live OS process count for the system source
    pub worker_count: usize,
}

/// Source of runtime load readings
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> RuntimeMetrics;
}

/// Metrics source backed by sysinfo
pub struct SystemMetricsSource {
    system: parking_lot::Mutex<System>,
}

impl SystemMetricsSource {
    pub fn new() -> Self {
        Self {
            system: parking_lot::Mutex::new(System::new_all()),
        }
    }
}

impl Default for SystemMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemMetricsSource {
    fn sample(&self) -> RuntimeMetrics {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_processes();

        let cpu_usage = (system.global_cpu_info().cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);
        let total = system.total_memory();
        let memory_usage = if total > 0 {
            (system.used_memory() as f64 / total as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let worker_count = system.processes().len();

        RuntimeMetrics {
            cpu_usage,
            memory_usage,
            worker_count,
        }
    }
}

/// Fixed-reading source for tests and simulations
pub struct StaticMetricsSource {
    reading: parking_lot::RwLock<RuntimeMetrics>,
}

impl StaticMetricsSource {
    pub fn new(reading: RuntimeMetrics) -> Self {
        Self {
            reading: parking_lot::RwLock::new(reading),
        }
    }

    pub fn set(&self, reading: RuntimeMetrics) {
        *self.reading.write() = reading;
    }
}

impl MetricsSource for StaticMetricsSource {
    fn sample(&self) -> RuntimeMetrics {
        *self.reading.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_source_returns_what_was_set() {
        let source = StaticMetricsSource::new(RuntimeMetrics {
            cpu_usage: 0.5,
            memory_usage: 0.25,
            worker_count: 4,
        });
        assert_eq!(source.sample().cpu_usage, 0.5);

        source.set(RuntimeMetrics {
            cpu_usage: 0.9,
            memory_usage: 0.8,
            worker_count: 16,
        });
        assert_eq!(source.sample().worker_count, 16);
    }

    #[test]
    fn system_source_stays_in_range() {
        let source = SystemMetricsSource::new();
        let reading = source.sample();
        assert!((0.0..=1.0).contains(&reading.cpu_usage));
        assert!((0.0..=1.0).contains(&reading.memory_usage));
    }
}
