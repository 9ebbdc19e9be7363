//! Passive performance profiling: bottleneck detection and trend analysis.
//!
//! Samples are pushed in by whoever observes them (the engine's monitor loop
//! in the default wiring) and grouped by component/metric. Detection compares
//! each group's windowed mean against a configured threshold; trend analysis
//! runs a least-squares regression over recent values.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProfilerConfig;

/// One observed measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    #[serde(skip, default = "Instant::now")]
    pub at: Instant,
    pub component: String,
    pub metric: String,
    pub value: f64,
    pub unit: String,
}

/// How bad a detected bottleneck is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What kind of resource a bottleneck points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    Cpu,
    Memory,
    Network,
    Worker,
    Cache,
    Latency,
    Throughput,
}

impl BottleneckKind {
    fn from_metric(metric: &str) -> Self {
        if metric.contains("cpu") {
            BottleneckKind::Cpu
        } else if metric.contains("memory") {
            BottleneckKind::Memory
        } else if metric.contains("worker") || metric.contains("thread") {
            BottleneckKind::Worker
        } else if metric.contains("latency") || metric.contains("wait") {
            BottleneckKind::Latency
        } else if metric.contains("hit_ratio") || metric.contains("cache") {
            BottleneckKind::Cache
        } else if metric.contains("throughput") || metric.contains("rate") {
            BottleneckKind::Throughput
        } else {
            BottleneckKind::Network
        }
    }

    fn suggestions(&self) -> Vec<String> {
        let lines: &[&str] = match self {
            BottleneckKind::Cpu => &[
                "reduce concurrent work or raise the worker ceiling",
                "profile hot paths for algorithmic wins",
            ],
            BottleneckKind::Memory => &[
                "shrink cache tiers or lower retention windows",
                "check for unbounded buffers and queues",
            ],
            BottleneckKind::Network => &[
                "scale the connection pool or batch requests",
            ],
            BottleneckKind::Worker => &["cap worker spawning and drain queues"],
            BottleneckKind::Cache => &[
                "grow the fast tier or loosen the prefetch threshold",
            ],
            BottleneckKind::Latency => &["pool more connections and prefetch hot keys"],
            BottleneckKind::Throughput => &["widen queues and rebalance tier capacities"],
        };
        lines.iter().map(|s| (*s).to_string()).collect()
    }
}

/// A sustained threshold violation in one sample group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottleneck {
    pub id: String,
    pub kind: BottleneckKind,
    pub severity: Severity,
    pub component: String,
    pub metric: String,
    pub mean: f64,
    pub peak: f64,
    pub threshold: f64,
    /// Percent the mean overshoots the threshold
    pub impact: f64,
    /// Grows with sample count, saturating at 1.0
    pub confidence: f64,
    pub suggestions: Vec<String>,
    /// Most recent samples behind the detection
    pub evidence: Vec<PerformanceSample>,
    pub detected_at: DateTime<Utc>,
}

/// Which way a metric is moving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

/// Regression outcome for one sample group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceTrend {
    pub component: String,
    pub metric: String,
    pub direction: TrendDirection,
    pub slope: f64,
    pub confidence: f64,
    pub samples: usize,
    pub analyzed_at: DateTime<Utc>,
}

/// Overall verdict in a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Good,
    Fair,
    Degraded,
}

/// Point-in-time assessment of everything the profiler has seen
#[derive(Debug, Clone, Serialize)]
pub struct ProfilingReport {
    pub generated_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub health: HealthVerdict,
    pub summary: String,
    /// Latest value per component/metric group
    pub metrics: HashMap<String, f64>,
    pub bottlenecks: Vec<Bottleneck>,
    pub trends: HashMap<String, PerformanceTrend>,
    pub recommendations: Vec<String>,
}

struct SampleGroup {
    component: String,
    metric: String,
    samples: VecDeque<PerformanceSample>,
    /// Recent values retained beyond the window for regression
    trend_values: VecDeque<f64>,
}

/// Passive profiler; all loops read, sampling writes
pub struct Profiler {
    config: ProfilerConfig,
    started_at: Instant,
    groups: DashMap<String, SampleGroup>,
    bottlenecks: DashMap<String, Bottleneck>,
    trends: DashMap<String, PerformanceTrend>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            started_at: Instant::now(),
            groups: DashMap::new(),
            bottlenecks: DashMap::new(),
            trends: DashMap::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Record one measurement, pruning the group to the detection window
    pub fn record_sample(&self, component: &str, metric: &str, value: f64, unit: &str) {
        let key = group_key(component, metric);
        let now = Instant::now();
        let mut group = self.groups.entry(key).or_insert_with(|| SampleGroup {
            component: component.to_string(),
            metric: metric.to_string(),
            samples: VecDeque::new(),
            trend_values: VecDeque::new(),
        });
        group.samples.push_back(PerformanceSample {
            timestamp: Utc::now(),
            at: now,
            component: component.to_string(),
            metric: metric.to_string(),
            value,
            unit: unit.to_string(),
        });
        let window = self.config.detection_window;
        while let Some(first) = group.samples.front() {
            if now.duration_since(first.at) > window {
                group.samples.pop_front();
            } else {
                break;
            }
        }
        group.trend_values.push_back(value);
        while group.trend_values.len() > self.config.trend_buffer_size {
            group.trend_values.pop_front();
        }
    }

    /// Compare each group's windowed mean against its threshold.
    ///
    /// Groups back under their threshold have their bottleneck entry cleared.
    pub fn detect_bottlenecks(&self) {
        for entry in self.groups.iter() {
            let group = entry.value();
            if group.samples.len() < self.config.min_sample_size {
                continue;
            }
            let threshold = match self.config.thresholds.get(&group.metric) {
                Some(threshold) => *threshold,
                None => continue,
            };
            if threshold <= 0.0 {
                continue;
            }
            let count = group.samples.len();
            let mean = group.samples.iter().map(|s| s.value).sum::<f64>() / count as f64;
            let peak = group
                .samples
                .iter()
                .map(|s| s.value)
                .fold(f64::MIN, f64::max);

            if mean <= threshold {
                self.bottlenecks.remove(entry.key());
                continue;
            }

            let ratio = mean / threshold;
            let severity = if ratio >= self.config.critical_ratio {
                Severity::Critical
            } else if ratio >= self.config.high_ratio {
                Severity::High
            } else {
                Severity::Medium
            };
            let kind = BottleneckKind::from_metric(&group.metric);
            let bottleneck = Bottleneck {
                id: format!("{}-{}", entry.key(), Utc::now().timestamp()),
                kind,
                severity,
                component: group.component.clone(),
                metric: group.metric.clone(),
                mean,
                peak,
                threshold,
                impact: (mean - threshold) / threshold * 100.0,
                confidence: (count as f64 / (2.0 * self.config.min_sample_size as f64)).min(1.0),
                suggestions: kind.suggestions(),
                evidence: group.samples.iter().rev().take(5).rev().cloned().collect(),
                detected_at: Utc::now(),
            };
            if severity >= Severity::High {
                warn!(
                    component = %group.component,
                    metric = %group.metric,
                    mean,
                    threshold,
                    ?severity,
                    "bottleneck detected"
                );
            }
            self.bottlenecks.insert(entry.key().clone(), bottleneck);
        }
    }

    /// Least-squares regression over each group's recent values
    pub fn analyze_trends(&self) {
        for entry in self.groups.iter() {
            let group = entry.value();
            let values = &group.trend_values;
            if values.len() < self.config.min_sample_size {
                continue;
            }
            let slope = regression_slope(values);
            let direction = if slope > self.config.slope_epsilon {
                TrendDirection::Degrading
            } else if slope < -self.config.slope_epsilon {
                TrendDirection::Improving
            } else {
                TrendDirection::Stable
            };
            let trend = PerformanceTrend {
                component: group.component.clone(),
                metric: group.metric.clone(),
                direction,
                slope,
                confidence: (values.len() as f64 / 50.0).min(1.0),
                samples: values.len(),
                analyzed_at: Utc::now(),
            };
            self.trends.insert(entry.key().clone(), trend);
        }
    }

    /// Current detections, keyed by component/metric group
    pub fn bottlenecks(&self) -> HashMap<String, Bottleneck> {
        self.bottlenecks
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn trends(&self) -> HashMap<String, PerformanceTrend> {
        self.trends
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Assemble a full report from current detections and trends
    pub fn generate_report(&self) -> ProfilingReport {
        let bottlenecks: Vec<Bottleneck> = self.bottlenecks().into_values().collect();
        let trends = self.trends();
        let metrics: HashMap<String, f64> = self
            .groups
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .samples
                    .back()
                    .map(|s| (entry.key().clone(), s.value))
            })
            .collect();

        let degrading = trends
            .values()
            .filter(|t| t.direction == TrendDirection::Degrading)
            .count();
        let health = if bottlenecks
            .iter()
            .any(|b| b.severity == Severity::Critical)
        {
            HealthVerdict::Degraded
        } else if !bottlenecks.is_empty() || degrading > 0 {
            HealthVerdict::Fair
        } else {
            HealthVerdict::Good
        };

        let mut recommendations: Vec<String> = bottlenecks
            .iter()
            .flat_map(|b| {
                b.suggestions
                    .iter()
                    .map(move |s| format!("{}/{}: {}", b.component, b.metric, s))
            })
            .collect();
        for trend in trends.values() {
            if trend.direction == TrendDirection::Degrading {
                recommendations.push(format!(
                    "{}/{} is degrading (slope {:.4}); investigate before it breaches",
                    trend.component, trend.metric, trend.slope
                ));
            }
        }

        ProfilingReport {
            generated_at: Utc::now(),
            uptime: self.started_at.elapsed(),
            health,
            summary: format!(
                "{} metric groups, {} bottlenecks, {} degrading trends; health {:?}",
                metrics.len(),
                bottlenecks.len(),
                degrading,
                health
            ),
            metrics,
            bottlenecks,
            trends,
            recommendations,
        }
    }

    /// Spawn the detection and trend loops
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let profiler = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.detection_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => profiler.detect_bottlenecks(),
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("bottleneck detection stopped");
        }));

        let profiler = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.trend_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => profiler.analyze_trends(),
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("trend analysis stopped");
        }));

        info!("profiler started");
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;
        info!("profiler stopped");
    }
}

fn group_key(component: &str, metric: &str) -> String {
    format!("{component}/{metric}")
}

fn regression_slope(values: &VecDeque<f64>) -> f64 {
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
