//! Closed-loop parameter tuning.
//!
//! Each iteration measures an objective, asks the strategy for candidate
//! assignments, applies them clamped to each parameter's envelope, then
//! measures again and records the outcome. External writes go through
//! [`AutoTuner::set_parameter_value`], which rejects out-of-bounds values
//! outright instead of clamping.

mod parameter;
mod strategy;

pub use parameter::{ParameterValue, TunableParameter};
pub use strategy::{HillClimb, Proposal, RandomSearch, TuningStrategy};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{TunerConfig, TunerStrategyKind};
use crate::error::{Error, Result};
use crate::metrics::{MetricsSource, RuntimeMetrics};

/// Scores a metrics reading; higher is better
pub trait Objective: Send + Sync {
    fn measure(&self, metrics: &RuntimeMetrics) -> f64;
}

/// Weighted closeness to target CPU and memory usage, scaled to [0, 100]
pub struct TargetProximityObjective {
    target_cpu: f64,
    target_memory: f64,
    cpu_weight: f64,
    memory_weight: f64,
}

impl TargetProximityObjective {
    pub fn new(config: &TunerConfig) -> Self {
        Self {
            target_cpu: config.target_cpu,
            target_memory: config.target_memory,
            cpu_weight: config.cpu_weight,
            memory_weight: config.memory_weight,
        }
    }
}

impl Objective for TargetProximityObjective {
    fn measure(&self, metrics: &RuntimeMetrics) -> f64 {
        let weight_sum = (self.cpu_weight + self.memory_weight).max(f64::EPSILON);
        let cpu_score = (1.0 - (metrics.cpu_usage - self.target_cpu).abs()).max(0.0);
        let memory_score = (1.0 - (metrics.memory_usage - self.target_memory).abs()).max(0.0);
        100.0 * (self.cpu_weight * cpu_score + self.memory_weight * memory_score) / weight_sum
    }
}

/// One applied parameter change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterChange {
    pub name: String,
    pub old_value: ParameterValue,
    pub new_value: ParameterValue,
}

/// Outcome of a single tuning iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningResult {
    pub success: bool,
    pub objective: f64,
    pub improvement: f64,
    pub changes: Vec<ParameterChange>,
    pub strategy: String,
    #[serde(with = "humantime_serde")]
    pub duration: std::time::Duration,
}

/// Archived iteration for later inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningEntry {
    pub timestamp: DateTime<Utc>,
    pub objective: f64,
    pub improvement: f64,
    pub strategy: String,
    pub success: bool,
    pub parameters: HashMap<String, ParameterValue>,
}

/// Rolling view of where the search stands
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdaptiveState {
    pub current_objective: f64,
    pub best_objective: f64,
    pub best_parameters: HashMap<String, ParameterValue>,
    pub iteration: u64,
    /// Walks toward 1.0 while iterations stay inside the convergence band
    pub convergence_score: f64,
    pub last_improvement: Option<DateTime<Utc>>,
}

/// Closed-loop tuner over a registry of tunable parameters
pub struct AutoTuner {
    config: TunerConfig,
    metrics_source: Arc<dyn MetricsSource>,
    objective: Box<dyn Objective>,
    strategy: Mutex<Box<dyn TuningStrategy>>,
    registry: RwLock<HashMap<String, TunableParameter>>,
    state: RwLock<AdaptiveState>,
    history: RwLock<VecDeque<TuningEntry>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutoTuner {
    pub fn new(config: TunerConfig, metrics_source: Arc<dyn MetricsSource>) -> Self {
        let objective = Box::new(TargetProximityObjective::new(&config));
        let strategy: Box<dyn TuningStrategy> = match config.strategy {
            TunerStrategyKind::HillClimb => {
                Box::new(HillClimb::new(config.exploration_rate, config.seed))
            }
            TunerStrategyKind::RandomSearch => Box::new(RandomSearch::new(config.seed)),
        };
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            metrics_source,
            objective,
            strategy: Mutex::new(strategy),
            registry: RwLock::new(HashMap::new()),
            state: RwLock::new(AdaptiveState::default()),
            history: RwLock::new(VecDeque::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Swap in a custom objective; intended for wiring, not mid-flight
    pub fn with_objective(mut self, objective: Box<dyn Objective>) -> Self {
        self.objective = objective;
        self
    }

    /// Add a parameter to the tuned set.
    ///
    /// The initial value must already lie inside its envelope.
    pub fn register_parameter(&self, parameter: TunableParameter) -> Result<()> {
        if !parameter.value.same_kind(&parameter.min)
            || !parameter.value.same_kind(&parameter.max)
            || !parameter.value.same_kind(&parameter.step)
        {
            return Err(Error::Config(format!(
                "parameter {}: value, bounds and step must share one type",
                parameter.name
            )));
        }
        if !parameter.value.within(&parameter.min, &parameter.max) {
            return Err(Error::ParameterOutOfBounds {
                name: parameter.name.clone(),
                value: parameter.value.to_string(),
                min: parameter.min.to_string(),
                max: parameter.max.to_string(),
            });
        }
        self.registry
            .write()
            .insert(parameter.name.clone(), parameter);
        Ok(())
    }

    /// External write path: rejects values outside the envelope
    pub fn set_parameter_value(&self, name: &str, value: ParameterValue) -> Result<()> {
        let mut registry = self.registry.write();
        let param = registry
            .get_mut(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        if !value.same_kind(&param.value) {
            return Err(Error::Config(format!(
                "parameter {name}: expected {}, got {}",
                param.value.kind(),
                value.kind()
            )));
        }
        if !value.within(&param.min, &param.max) {
            return Err(Error::ParameterOutOfBounds {
                name: name.to_string(),
                value: value.to_string(),
                min: param.min.to_string(),
                max: param.max.to_string(),
            });
        }
        param.value = value;
        Ok(())
    }

    pub fn parameter(&self, name: &str) -> Option<TunableParameter> {
        self.registry.read().get(name).cloned()
    }

    pub fn parameters(&self) -> Vec<TunableParameter> {
        self.registry.read().values().cloned().collect()
    }

    pub fn adaptive_state(&self) -> AdaptiveState {
        self.state.read().clone()
    }

    pub fn history(&self) -> Vec<TuningEntry> {
        self.history.read().iter().cloned().collect()
    }

    /// Run one measure-propose-apply-measure iteration
    pub fn tune(&self) -> TuningResult {
        let started = Instant::now();
        let before = self
            .objective
            .measure(&self.metrics_source.sample());

        let regressed = {
            let mut state = self.state.write();
            state.iteration += 1;
            state.current_objective = before;
            let regressed = state.iteration > 1 && before < state.best_objective;
            if before > state.best_objective || state.iteration == 1 {
                state.best_objective = before;
                state.last_improvement = Some(Utc::now());
                state.best_parameters = self
                    .registry
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.value.clone()))
                    .collect();
            }
            regressed
        };

        let snapshot = self.parameters();
        let proposals = self.strategy.lock().propose(
            &snapshot,
            regressed,
            self.config.learning_rate,
        );
        let strategy_name = self.strategy.lock().name().to_string();

        let mut changes = Vec::new();
        {
            let mut registry = self.registry.write();
            for proposal in proposals {
                if let Some(param) = registry.get_mut(&proposal.name) {
                    let clamped = proposal.value.clamp_to(&param.min, &param.max);
                    if clamped != param.value {
                        changes.push(ParameterChange {
                            name: param.name.clone(),
                            old_value: param.value.clone(),
                            new_value: clamped.clone(),
                        });
                        param.value = clamped;
                        param.last_tuned_at = Some(Utc::now());
                        param.tuning_count += 1;
                    }
                }
            }
        }

        let after = self
            .objective
            .measure(&self.metrics_source.sample());
        let improvement = after - before;

        {
            let mut state = self.state.write();
            if after > state.best_objective {
                state.best_objective = after;
                state.last_improvement = Some(Utc::now());
                state.best_parameters = self
                    .registry
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.value.clone()))
                    .collect();
            }
            if improvement.abs() < self.config.convergence_threshold {
                state.convergence_score = (state.convergence_score + 0.1).min(1.0);
            } else {
                state.convergence_score = 0.0;
            }
        }

        let entry = TuningEntry {
            timestamp: Utc::now(),
            objective: after,
            improvement,
            strategy: strategy_name.clone(),
            success: improvement > 0.0,
            parameters: self
                .registry
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect(),
        };
        {
            let mut history = self.history.write();
            history.push_back(entry);
            while history.len() > self.config.history_retention {
                history.pop_front();
            }
        }

        let result = TuningResult {
            success: improvement > 0.0,
            objective: after,
            improvement,
            changes,
            strategy: strategy_name,
            duration: started.elapsed(),
        };
        debug!(
            objective = result.objective,
            improvement = result.improvement,
            changes = result.changes.len(),
            "tuning iteration finished"
        );
        result
    }

    /// Spawn the periodic tuning loop
    pub fn start(self: &Arc<Self>) {
        let tuner = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.tuning_interval;
        self.tasks.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tuner.tune();
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("tuning loop stopped");
        }));
        info!(strategy = ?self.config.strategy, "auto-tuner started");
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;
        info!("auto-tuner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StaticMetricsSource;
    use std::time::Duration;

    fn tuner(config: TunerConfig) -> AutoTuner {
        let source = Arc::new(StaticMetricsSource::new(RuntimeMetrics {
            cpu_usage: 0.6,
            memory_usage: 0.7,
            worker_count: 8,
        }));
        AutoTuner::new(config, source)
    }

    fn small_config() -> TunerConfig {
        TunerConfig {
            history_retention: 5,
            seed: 17,
            ..TunerConfig::default()
        }
    }

    #[test]
    fn objective_peaks_at_targets() {
        let config = TunerConfig::default();
        let objective = TargetProximityObjective::new(&config);
        let on_target = objective.measure(&RuntimeMetrics {
            cpu_usage: config.target_cpu,
            memory_usage: config.target_memory,
            worker_count: 0,
        });
        assert!((on_target - 100.0).abs() < 1e-9);
        let off_target = objective.measure(&RuntimeMetrics {
            cpu_usage: 1.0,
            memory_usage: 1.0,
            worker_count: 0,
        });
        assert!(off_target < on_target);
    }

    #[test]
    fn iterations_never_leave_bounds() {
        let tuner = tuner(small_config());
        tuner
            .register_parameter(TunableParameter::int("workers", "engine", 100, 10, 1000, 10))
            .unwrap();
        tuner
            .register_parameter(TunableParameter::float("ratio", "cache", 0.5, 0.1, 0.9, 0.05))
            .unwrap();
        for _ in 0..50 {
            tuner.tune();
            for param in tuner.parameters() {
                assert!(param.value.within(&param.min, &param.max));
            }
        }
    }

    #[test]
    fn external_out_of_bounds_is_rejected_not_clamped() {
        let tuner = tuner(small_config());
        tuner
            .register_parameter(TunableParameter::int("workers", "engine", 100, 10, 1000, 10))
            .unwrap();
        let err = tuner
            .set_parameter_value("workers", ParameterValue::Int(5000))
            .unwrap_err();
        assert!(matches!(err, Error::ParameterOutOfBounds { .. }));
        // the stored value is untouched
        assert_eq!(
            tuner.parameter("workers").unwrap().value,
            ParameterValue::Int(100)
        );
        assert!(tuner
            .set_parameter_value("workers", ParameterValue::Int(500))
            .is_ok());
    }

    #[test]
    fn unknown_parameter_and_kind_mismatch_are_errors() {
        let tuner = tuner(small_config());
        tuner
            .register_parameter(TunableParameter::int("workers", "engine", 100, 10, 1000, 10))
            .unwrap();
        assert!(matches!(
            tuner.set_parameter_value("missing", ParameterValue::Int(1)),
            Err(Error::UnknownParameter(_))
        ));
        assert!(matches!(
            tuner.set_parameter_value("workers", ParameterValue::Float(0.5)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn register_rejects_out_of_envelope_initial_value() {
        let tuner = tuner(small_config());
        let err = tuner
            .register_parameter(TunableParameter::int("bad", "engine", 5, 10, 100, 1))
            .unwrap_err();
        assert!(matches!(err, Error::ParameterOutOfBounds { .. }));
    }

    #[test]
    fn history_is_bounded() {
        let tuner = tuner(small_config());
        tuner
            .register_parameter(TunableParameter::int("workers", "engine", 100, 10, 1000, 10))
            .unwrap();
        for _ in 0..20 {
            tuner.tune();
        }
        assert_eq!(tuner.history().len(), 5);
        assert_eq!(tuner.adaptive_state().iteration, 20);
    }

    #[test]
    fn static_metrics_drive_convergence_score_up() {
        let tuner = tuner(small_config());
        for _ in 0..20 {
            tuner.tune();
        }
        // a fixed reading means zero improvement every time
        assert!(tuner.adaptive_state().convergence_score >= 1.0 - 1e-9);
    }

    #[tokio::test]
    async fn background_loop_runs_and_stops() {
        let config = TunerConfig {
            tuning_interval: Duration::from_millis(10),
            ..small_config()
        };
        let tuner = Arc::new(tuner(config));
        tuner
            .register_parameter(TunableParameter::int("workers", "engine", 100, 10, 1000, 10))
            .unwrap();
        tuner.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tuner.shutdown().await;
        assert!(tuner.adaptive_state().iteration >= 2);
    }
}
