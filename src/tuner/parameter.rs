//! Tunable parameter values and their arithmetic.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One typed parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Duration(#[serde(with = "humantime_serde")] Duration),
}

impl ParameterValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Int(_) => "int",
            ParameterValue::Float(_) => "float",
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Text(_) => "text",
            ParameterValue::Duration(_) => "duration",
        }
    }

    pub fn same_kind(&self, other: &ParameterValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Move this value by `step * factor`; the sign of `factor` sets the
    /// direction. Bool and Text values do not step.
    pub fn step_by(&self, step: &ParameterValue, factor: f64) -> ParameterValue {
        match (self, step) {
            (ParameterValue::Int(v), ParameterValue::Int(s)) => {
                let delta = (*s as f64 * factor).round() as i64;
                ParameterValue::Int(v.saturating_add(delta))
            }
            (ParameterValue::Float(v), ParameterValue::Float(s)) => {
                ParameterValue::Float(v + s * factor)
            }
            (ParameterValue::Duration(v), ParameterValue::Duration(s)) => {
                let next = (v.as_secs_f64() + s.as_secs_f64() * factor).max(0.0);
                ParameterValue::Duration(Duration::from_secs_f64(next))
            }
            _ => self.clone(),
        }
    }

    /// Pull this value inside [min, max]; Bool and Text pass through
    pub fn clamp_to(&self, min: &ParameterValue, max: &ParameterValue) -> ParameterValue {
        match (self, min, max) {
            (ParameterValue::Int(v), ParameterValue::Int(lo), ParameterValue::Int(hi)) => {
                ParameterValue::Int((*v).clamp(*lo, *hi))
            }
            (ParameterValue::Float(v), ParameterValue::Float(lo), ParameterValue::Float(hi)) => {
                ParameterValue::Float(v.clamp(*lo, *hi))
            }
            (
                ParameterValue::Duration(v),
                ParameterValue::Duration(lo),
                ParameterValue::Duration(hi),
            ) => ParameterValue::Duration((*v).clamp(*lo, *hi)),
            _ => self.clone(),
        }
    }

    /// True if the value lies inside [min, max]; Bool and Text always do
    pub fn within(&self, min: &ParameterValue, max: &ParameterValue) -> bool {
        match (self, min, max) {
            (ParameterValue::Int(v), ParameterValue::Int(lo), ParameterValue::Int(hi)) => {
                lo <= v && v <= hi
            }
            (ParameterValue::Float(v), ParameterValue::Float(lo), ParameterValue::Float(hi)) => {
                lo <= v && v <= hi
            }
            (
                ParameterValue::Duration(v),
                ParameterValue::Duration(lo),
                ParameterValue::Duration(hi),
            ) => lo <= v && v <= hi,
            _ => true,
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Int(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::Bool(v) => write!(f, "{v}"),
            ParameterValue::Text(v) => write!(f, "{v}"),
            ParameterValue::Duration(v) => write!(f, "{v:?}"),
        }
    }
}

/// A registered parameter plus its tuning envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunableParameter {
    pub name: String,
    /// Subsystem this parameter belongs to
    pub component: String,
    pub value: ParameterValue,
    pub min: ParameterValue,
    pub max: ParameterValue,
    pub step: ParameterValue,
    /// Relative weight of this parameter on the objective, in [0, 1]
    pub impact: f64,
    /// Scales the step the strategy takes per iteration
    pub sensitivity: f64,
    pub last_tuned_at: Option<DateTime<Utc>>,
    pub tuning_count: u64,
}

impl TunableParameter {
    pub fn new(
        name: impl Into<String>,
        component: impl Into<String>,
        value: ParameterValue,
        min: ParameterValue,
        max: ParameterValue,
        step: ParameterValue,
    ) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            value,
            min,
            max,
            step,
            impact: 0.5,
            sensitivity: 1.0,
            last_tuned_at: None,
            tuning_count: 0,
        }
    }

    pub fn int(
        name: impl Into<String>,
        component: impl Into<String>,
        value: i64,
        min: i64,
        max: i64,
        step: i64,
    ) -> Self {
        Self::new(
            name,
            component,
            ParameterValue::Int(value),
            ParameterValue::Int(min),
            ParameterValue::Int(max),
            ParameterValue::Int(step),
        )
    }

    pub fn float(
        name: impl Into<String>,
        component: impl Into<String>,
        value: f64,
        min: f64,
        max: f64,
        step: f64,
    ) -> Self {
        Self::new(
            name,
            component,
            ParameterValue::Float(value),
            ParameterValue::Float(min),
            ParameterValue::Float(max),
            ParameterValue::Float(step),
        )
    }

    pub fn duration(
        name: impl Into<String>,
        component: impl Into<String>,
        value: Duration,
        min: Duration,
        max: Duration,
        step: Duration,
    ) -> Self {
        Self::new(
            name,
            component,
            ParameterValue::Duration(value),
            ParameterValue::Duration(min),
            ParameterValue::Duration(max),
            ParameterValue::Duration(step),
        )
    }

    pub fn with_impact(mut self, impact: f64) -> Self {
        self.impact = impact.clamp(0.0, 1.0);
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity.max(0.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_step_rounds_and_clamps() {
        let value = ParameterValue::Int(100);
        let stepped = value.step_by(&ParameterValue::Int(10), 0.26);
        assert_eq!(stepped, ParameterValue::Int(103));
        let clamped = ParameterValue::Int(5000).clamp_to(
            &ParameterValue::Int(0),
            &ParameterValue::Int(1000),
        );
        assert_eq!(clamped, ParameterValue::Int(1000));
    }

    #[test]
    fn duration_step_never_goes_negative() {
        let value = ParameterValue::Duration(Duration::from_secs(1));
        let stepped = value.step_by(&ParameterValue::Duration(Duration::from_secs(10)), -1.0);
        assert_eq!(stepped, ParameterValue::Duration(Duration::ZERO));
    }

    #[test]
    fn bool_and_text_do_not_step_or_clamp() {
        let flag = ParameterValue::Bool(true);
        assert_eq!(flag.step_by(&ParameterValue::Bool(false), 1.0), flag);
        let label = ParameterValue::Text("lru".into());
        assert_eq!(
            label.clamp_to(&ParameterValue::Text("a".into()), &ParameterValue::Text("z".into())),
            label
        );
        assert!(flag.within(&ParameterValue::Bool(false), &ParameterValue::Bool(false)));
    }

    #[test]
    fn within_respects_bounds() {
        let value = ParameterValue::Float(0.5);
        assert!(value.within(&ParameterValue::Float(0.0), &ParameterValue::Float(1.0)));
        assert!(!value.within(&ParameterValue::Float(0.6), &ParameterValue::Float(1.0)));
    }

    #[test]
    fn value_serializes_with_tag() {
        let value = ParameterValue::Duration(Duration::from_secs(30));
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["type"], "duration");
    }
}
