//! The optimization engine: bounded request queue, consumer loop, and a
//! resource monitor that synthesizes requests from load and profiler output.
//!
//! The engine owns the tuner and profiler and reaches the cache and pool
//! through narrow control traits, so any cache value type or connection
//! factory can sit behind it.

mod optimizers;
mod request;

pub use optimizers::{CacheOptimizer, PoolOptimizer, StrategyHook};
pub use request::{
    OptimizationChange, OptimizationKind, OptimizationMetrics, OptimizationRequest,
    OptimizationResult, Priority,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheControl;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics::{MetricsSource, RuntimeMetrics, SystemMetricsSource};
use crate::pool::PoolControl;
use crate::profiler::{Bottleneck, BottleneckKind, Profiler, Severity};
use crate::tuner::AutoTuner;

struct ExportedMetrics {
    registry: Registry,
    total: IntCounter,
    successful: IntCounter,
    failed: IntCounter,
    average_improvement: Gauge,
    cpu_usage: Gauge,
    memory_usage: Gauge,
}

impl ExportedMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let total = IntCounter::new("perfcore_optimizations_total", "Requests processed")?;
        let successful =
            IntCounter::new("perfcore_optimizations_successful", "Successful optimizations")?;
        let failed = IntCounter::new("perfcore_optimizations_failed", "Failed optimizations")?;
        let average_improvement = Gauge::new(
            "perfcore_average_improvement",
            "Moving average of measured improvement",
        )?;
        let cpu_usage = Gauge::new("perfcore_cpu_usage", "Last sampled CPU usage ratio")?;
        let memory_usage =
            Gauge::new("perfcore_memory_usage", "Last sampled memory usage ratio")?;
        registry.register(Box::new(total.clone()))?;
        registry.register(Box::new(successful.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(average_improvement.clone()))?;
        registry.register(Box::new(cpu_usage.clone()))?;
        registry.register(Box::new(memory_usage.clone()))?;
        Ok(Self {
            registry,
            total,
            successful,
            failed,
            average_improvement,
            cpu_usage,
            memory_usage,
        })
    }
}

/// Orchestrates optimization work across the cache, pool, tuner and profiler
pub struct OptimizationEngine {
    config: EngineConfig,
    enabled: AtomicBool,
    queue_tx: mpsc::Sender<OptimizationRequest>,
    queue_rx: Mutex<Option<mpsc::Receiver<OptimizationRequest>>>,
    metrics: RwLock<OptimizationMetrics>,
    metrics_source: Arc<dyn MetricsSource>,
    tuner: Arc<AutoTuner>,
    profiler: Arc<Profiler>,
    cache: RwLock<Option<Arc<dyn CacheControl>>>,
    pool: RwLock<Option<Arc<dyn PoolControl>>>,
    hooks: RwLock<HashMap<OptimizationKind, Arc<dyn StrategyHook>>>,
    cache_optimizer: CacheOptimizer,
    pool_optimizer: PoolOptimizer,
    exported: ExportedMetrics,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OptimizationEngine {
    pub fn new(
        config: EngineConfig,
        tuner: Arc<AutoTuner>,
        profiler: Arc<Profiler>,
    ) -> Result<Self> {
        Self::with_metrics_source(config, tuner, profiler, Arc::new(SystemMetricsSource::new()))
    }

    pub fn with_metrics_source(
        config: EngineConfig,
        tuner: Arc<AutoTuner>,
        profiler: Arc<Profiler>,
        metrics_source: Arc<dyn MetricsSource>,
    ) -> Result<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let enabled = config.enabled;
        Ok(Self {
            config,
            enabled: AtomicBool::new(enabled),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            metrics: RwLock::new(OptimizationMetrics::default()),
            metrics_source,
            tuner,
            profiler,
            cache: RwLock::new(None),
            pool: RwLock::new(None),
            hooks: RwLock::new(HashMap::new()),
            cache_optimizer: CacheOptimizer::default(),
            pool_optimizer: PoolOptimizer::default(),
            exported: ExportedMetrics::new()?,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn attach_cache(&self, cache: Arc<dyn CacheControl>) {
        *self.cache.write() = Some(cache);
    }

    pub fn attach_pool(&self, pool: Arc<dyn PoolControl>) {
        *self.pool.write() = Some(pool);
    }

    /// Install a handler for algorithm, latency or throughput requests
    pub fn register_strategy(&self, kind: OptimizationKind, hook: Arc<dyn StrategyHook>) {
        self.hooks.write().insert(kind, hook);
    }

    pub fn tuner(&self) -> &Arc<AutoTuner> {
        &self.tuner
    }

    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    /// Enqueue a request; fails fast when the queue is full or the engine
    /// is disabled
    pub fn request_optimization(&self, request: OptimizationRequest) -> Result<()> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(Error::EngineDisabled);
        }
        match self.queue_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::EngineDisabled),
        }
    }

    pub fn metrics(&self) -> OptimizationMetrics {
        self.metrics.read().clone()
    }

    /// Render the Prometheus exposition text for the engine's counters
    pub fn export_prometheus(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.exported.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Optimization(e.to_string()))
    }

    /// Spawn the consumer and monitor loops and start the owned subsystems
    pub fn start(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) {
            info!("optimization engine disabled, not starting loops");
            return;
        }
        self.tuner.start();
        self.profiler.start();

        let mut tasks = self.tasks.lock();

        if let Some(mut rx) = self.queue_rx.lock().take() {
            let engine = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        request = rx.recv() => {
                            match request {
                                Some(request) => {
                                    let result = engine.process(&request).await;
                                    engine.absorb_result(&result);
                                }
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
                let mut discarded = 0usize;
                while rx.try_recv().is_ok() {
                    discarded += 1;
                }
                if discarded > 0 {
                    info!(discarded, "dropped queued optimization requests on shutdown");
                }
                debug!("optimization consumer stopped");
            }));
        }

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.optimization_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.monitor_tick(),
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("resource monitor stopped");
        }));

        info!(
            queue_capacity = self.config.queue_capacity,
            interval = ?self.config.optimization_interval,
            "optimization engine started"
        );
    }

    /// Stop intake, drain the loops and shut the owned subsystems down
    pub async fn shutdown(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;
        self.tuner.shutdown().await;
        self.profiler.shutdown().await;
        info!("optimization engine stopped");
    }

    /// Dispatch one request to the matching pass
    async fn process(&self, request: &OptimizationRequest) -> OptimizationResult {
        let started = Instant::now();
        debug!(
            id = %request.id,
            kind = %request.kind,
            component = %request.component,
            "processing optimization request"
        );
        let outcome: Result<(f64, Vec<OptimizationChange>)> = match request.kind {
            OptimizationKind::Cache => {
                let cache = self.cache.read().clone();
                match cache {
                    Some(cache) => Ok(self.cache_optimizer.optimize(cache.as_ref())),
                    None => Err(Error::Optimization("no cache attached".into())),
                }
            }
            OptimizationKind::Network => {
                let pool = self.pool.read().clone();
                match pool {
                    Some(pool) => Ok(self.pool_optimizer.optimize(pool.as_ref())),
                    None => Err(Error::Optimization("no connection pool attached".into())),
                }
            }
            OptimizationKind::Cpu | OptimizationKind::Memory | OptimizationKind::Resource => {
                let tuning = self.tuner.tune();
                let changes = tuning
                    .changes
                    .iter()
                    .map(|change| OptimizationChange {
                        component: "tuner".into(),
                        parameter: change.name.clone(),
                        old_value: change.old_value.as_json(),
                        new_value: change.new_value.as_json(),
                        reversible: true,
                    })
                    .collect();
                Ok((tuning.improvement, changes))
            }
            OptimizationKind::Algorithm
            | OptimizationKind::Latency
            | OptimizationKind::Throughput => {
                let hook = self.hooks.read().get(&request.kind).cloned();
                match hook {
                    Some(hook) => hook.optimize(request).await,
                    None => Err(Error::Optimization(format!(
                        "no hook registered for {} requests",
                        request.kind
                    ))),
                }
            }
        };

        match outcome {
            Ok((improvement, changes)) => OptimizationResult {
                request_id: request.id.clone(),
                kind: request.kind,
                success: true,
                improvement,
                changes,
                error: None,
                duration: started.elapsed(),
                finished_at: Utc::now(),
            },
            Err(e) => {
                warn!(id = %request.id, kind = %request.kind, error = %e, "optimization failed");
                OptimizationResult::failure(request, e.to_string(), started.elapsed())
            }
        }
    }

    /// Fold one result into the aggregate and exported metrics
    fn absorb_result(&self, result: &OptimizationResult) {
        let mut metrics = self.metrics.write();
        metrics.total += 1;
        *metrics.by_kind.entry(result.kind).or_insert(0) += 1;
        metrics.last_optimization = Some(result.finished_at);
        self.exported.total.inc();
        if result.success {
            metrics.successful += 1;
            let n = metrics.successful as f64;
            metrics.average_improvement =
                (metrics.average_improvement * (n - 1.0) + result.improvement) / n;
            match result.kind {
                OptimizationKind::Cpu => metrics.cpu_improvement += result.improvement,
                OptimizationKind::Memory => metrics.memory_improvement += result.improvement,
                OptimizationKind::Latency => metrics.latency_improvement += result.improvement,
                OptimizationKind::Throughput => {
                    metrics.throughput_improvement += result.improvement
                }
                _ => {}
            }
            self.exported.successful.inc();
            self.exported
                .average_improvement
                .set(metrics.average_improvement);
        } else {
            metrics.failed += 1;
            metrics.last_error = result.error.clone();
            self.exported.failed.inc();
        }
    }

    /// One monitor pass: sample load, feed the profiler, synthesize requests
    fn monitor_tick(&self) {
        let reading = self.metrics_source.sample();
        self.exported.cpu_usage.set(reading.cpu_usage);
        self.exported.memory_usage.set(reading.memory_usage);

        self.profiler
            .record_sample("system", "cpu_usage", reading.cpu_usage, "ratio");
        self.profiler
            .record_sample("system", "memory_usage", reading.memory_usage, "ratio");
        self.profiler.record_sample(
            "runtime",
            "worker_count",
            reading.worker_count as f64,
            "count",
        );
        if let Some(cache) = self.cache.read().clone() {
            let stats = cache.stats();
            self.profiler
                .record_sample("cache", "hit_ratio", stats.hit_ratio, "ratio");
        }
        if let Some(pool) = self.pool.read().clone() {
            let stats = pool.stats();
            self.profiler
                .record_sample("pool", "utilization", stats.utilization, "ratio");
        }

        self.synthesize_from_load(&reading);
        for bottleneck in self.profiler.bottlenecks().into_values() {
            if bottleneck.severity >= Severity::High {
                self.synthesize_from_bottleneck(&bottleneck);
            }
        }
    }

    fn synthesize_from_load(&self, reading: &RuntimeMetrics) {
        if reading.cpu_usage > self.config.cpu_threshold {
            self.enqueue_synthetic(
                OptimizationRequest::new(OptimizationKind::Cpu, Priority::High, "system")
                    .with_metric("cpu_usage", reading.cpu_usage),
            );
        }
        if reading.memory_usage > self.config.memory_threshold {
            self.enqueue_synthetic(
                OptimizationRequest::new(OptimizationKind::Memory, Priority::High, "system")
                    .with_metric("memory_usage", reading.memory_usage),
            );
        }
        if reading.worker_count > self.config.max_workers {
            self.enqueue_synthetic(
                OptimizationRequest::new(OptimizationKind::Resource, Priority::Medium, "runtime")
                    .with_metric("worker_count", reading.worker_count as f64),
            );
        }
    }

    fn synthesize_from_bottleneck(&self, bottleneck: &Bottleneck) {
        let kind = match bottleneck.kind {
            BottleneckKind::Cpu => OptimizationKind::Cpu,
            BottleneckKind::Memory => OptimizationKind::Memory,
            BottleneckKind::Network => OptimizationKind::Network,
            BottleneckKind::Worker => OptimizationKind::Resource,
            BottleneckKind::Cache => OptimizationKind::Cache,
            BottleneckKind::Latency => OptimizationKind::Latency,
            BottleneckKind::Throughput => OptimizationKind::Throughput,
        };
        let priority = match bottleneck.severity {
            Severity::Critical => Priority::Critical,
            Severity::High => Priority::High,
            Severity::Medium => Priority::Medium,
            Severity::Low => Priority::Low,
        };
        self.enqueue_synthetic(
            OptimizationRequest::new(kind, priority, bottleneck.component.clone())
                .with_metric(bottleneck.metric.clone(), bottleneck.mean),
        );
    }

    fn enqueue_synthetic(&self, request: OptimizationRequest) {
        if let Err(e) = self.request_optimization(request) {
            debug!(error = %e, "synthetic optimization request not queued");
        }
    }
}
