//! End-to-end wiring: cache + pool + tuner + profiler behind the engine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use perfcore::cache::{CacheControl, MultiLevelCache};
use perfcore::config::PerfConfig;
use perfcore::engine::{OptimizationEngine, OptimizationKind, OptimizationRequest, Priority};
use perfcore::metrics::{MetricsSource, RuntimeMetrics, StaticMetricsSource};
use perfcore::pool::{ConnectionFactory, ConnectionPool, PoolControl};
use perfcore::profiler::Profiler;
use perfcore::tuner::{AutoTuner, TunableParameter};
use perfcore::Result;

struct LoopbackFactory {
    serial: AtomicU32,
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    type Conn = u32;

    async fn connect(&self) -> Result<u32> {
        Ok(self.serial.fetch_add(1, Ordering::SeqCst))
    }

    fn validate(&self, _conn: &mut u32) -> bool {
        true
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> PerfConfig {
    PerfConfig::from_toml_str(
        r#"
        [engine]
        optimization_interval = "25ms"
        queue_capacity = 64

        [cache]
        maintenance_interval = "50ms"

        [cache.prefetch]
        threshold = 0.2

        [pool]
        max_connections = 8
        min_connections = 2
        acquire_timeout = "200ms"
        maintenance_interval = "50ms"

        [tuner]
        tuning_interval = "40ms"

        [profiler]
        detection_interval = "30ms"
        trend_interval = "60ms"
        "#,
    )
    .expect("config parses")
}

#[tokio::test]
async fn engine_drives_all_subsystems_under_load() {
    init_tracing();
    let config = test_config();

    let source = Arc::new(StaticMetricsSource::new(RuntimeMetrics {
        cpu_usage: 0.95,
        memory_usage: 0.9,
        worker_count: 4,
    }));
    let tuner = Arc::new(AutoTuner::new(
        config.tuner.clone(),
        source.clone() as Arc<dyn MetricsSource>,
    ));
    tuner
        .register_parameter(TunableParameter::int("batch_size", "app", 64, 8, 1024, 8))
        .expect("parameter registers");

    let profiler = Arc::new(Profiler::new(config.profiler.clone()));
    let engine = Arc::new(
        OptimizationEngine::with_metrics_source(
            config.engine.clone(),
            tuner,
            profiler,
            source.clone() as Arc<dyn MetricsSource>,
        )
        .expect("engine builds"),
    );

    let cache: Arc<MultiLevelCache<String>> = Arc::new(MultiLevelCache::new(&config.cache));
    cache.start();
    let pool = Arc::new(ConnectionPool::new(
        LoopbackFactory {
            serial: AtomicU32::new(0),
        },
        config.pool.clone(),
    ));
    pool.start();

    engine.attach_cache(cache.clone() as Arc<dyn CacheControl>);
    engine.attach_pool(pool.clone() as Arc<dyn PoolControl>);
    engine.start();

    // exercise the cache and pool while the loops run
    for i in 0..50 {
        cache.set(&format!("key{i}"), format!("value{i}"), None);
    }
    for i in 0..200 {
        cache.get(&format!("key{}", i % 60));
    }
    let conn = pool.acquire().await.expect("acquire");
    pool.release(conn);

    // explicit requests alongside the monitor's synthetic ones
    engine
        .request_optimization(OptimizationRequest::new(
            OptimizationKind::Cache,
            Priority::High,
            "cache",
        ))
        .expect("cache request queued");
    engine
        .request_optimization(OptimizationRequest::new(
            OptimizationKind::Network,
            Priority::Medium,
            "pool",
        ))
        .expect("pool request queued");

    tokio::time::sleep(Duration::from_millis(400)).await;

    let metrics = engine.metrics();
    assert!(metrics.total >= 2, "engine processed requests");
    assert!(metrics.successful >= 2);
    assert!(metrics.by_kind.contains_key(&OptimizationKind::Cache));

    // the monitor fed the profiler and the hot readings produced bottlenecks
    let report = engine.profiler().generate_report();
    assert!(report.metrics.contains_key("system/cpu_usage"));
    assert!(report.metrics.contains_key("cache/hit_ratio"));

    // the tuning loop ran against the static source
    assert!(engine.tuner().adaptive_state().iteration >= 1);

    let exposition = engine.export_prometheus().expect("prometheus renders");
    assert!(exposition.contains("perfcore_optimizations_total"));

    engine.shutdown().await;
    pool.shutdown().await;
    cache.shutdown().await;

    // intake is closed after shutdown
    let err = engine
        .request_optimization(OptimizationRequest::new(
            OptimizationKind::Cpu,
            Priority::Low,
            "system",
        ))
        .unwrap_err();
    assert!(matches!(err, perfcore::Error::EngineDisabled));
}

#[tokio::test]
async fn pool_stays_within_ceiling_under_concurrent_acquires() {
    init_tracing();
    let mut config = test_config();
    config.pool.max_connections = 4;
    config.pool.min_connections = 0;

    let pool = Arc::new(ConnectionPool::new(
        LoopbackFactory {
            serial: AtomicU32::new(0),
        },
        config.pool.clone(),
    ));

    let mut workers = Vec::new();
    for _ in 0..16 {
        let pool = Arc::clone(&pool);
        workers.push(tokio::spawn(async move {
            for _ in 0..10 {
                let conn = pool.acquire().await.expect("acquire under contention");
                tokio::time::sleep(Duration::from_millis(1)).await;
                pool.release(conn);
            }
        }));
    }
    for worker in workers {
        worker.await.expect("worker finishes");
    }

    let stats = pool.stats();
    assert!(stats.total <= 4);
    assert!(stats.peak <= 4);
    assert!(stats.reused > 0);
}
