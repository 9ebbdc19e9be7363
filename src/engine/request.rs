//! Optimization request and result types.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an optimization request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    Cpu,
    Memory,
    Network,
    Cache,
    Algorithm,
    Resource,
    Latency,
    Throughput,
}

impl OptimizationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationKind::Cpu => "cpu",
            OptimizationKind::Memory => "memory",
            OptimizationKind::Network => "network",
            OptimizationKind::Cache => "cache",
            OptimizationKind::Algorithm => "algorithm",
            OptimizationKind::Resource => "resource",
            OptimizationKind::Latency => "latency",
            OptimizationKind::Throughput => "throughput",
        }
    }
}

impl fmt::Display for OptimizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request urgency; affects nothing but logging today, carried for consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// One unit of work for the engine's consumer loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub id: String,
    pub kind: OptimizationKind,
    pub priority: Priority,
    /// Subsystem that triggered the request
    pub component: String,
    /// Metric readings captured when the request was raised
    pub metrics: HashMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

impl OptimizationRequest {
    pub fn new(kind: OptimizationKind, priority: Priority, component: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            priority,
            component: component.into(),
            metrics: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// One applied adjustment, recorded for auditability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationChange {
    pub component: String,
    pub parameter: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub reversible: bool,
}

/// Outcome of processing one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub request_id: String,
    pub kind: OptimizationKind,
    pub success: bool,
    /// Measured score delta; zero when nothing moved
    pub improvement: f64,
    pub changes: Vec<OptimizationChange>,
    pub error: Option<String>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
}

impl OptimizationResult {
    pub fn failure(request: &OptimizationRequest, error: String, duration: Duration) -> Self {
        Self {
            request_id: request.id.clone(),
            kind: request.kind,
            success: false,
            improvement: 0.0,
            changes: Vec::new(),
            error: Some(error),
            duration,
            finished_at: Utc::now(),
        }
    }
}

/// Aggregate counters over everything the engine has processed
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Moving average over successful optimizations
    pub average_improvement: f64,
    pub by_kind: HashMap<OptimizationKind, u64>,
    pub cpu_improvement: f64,
    pub memory_improvement: f64,
    pub latency_improvement: f64,
    pub throughput_improvement: f64,
    pub last_optimization: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
