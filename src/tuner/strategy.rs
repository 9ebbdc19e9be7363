//! Search strategies for the auto-tuner.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::parameter::{ParameterValue, TunableParameter};

/// One proposed parameter assignment
#[derive(Debug, Clone)]
pub struct Proposal {
    pub name: String,
    pub value: ParameterValue,
}

/// Produces candidate parameter assignments for one tuning iteration
pub trait TuningStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `regressed` is true when the objective fell since the last iteration,
    /// a signal to back off the previous direction
    fn propose(
        &mut self,
        parameters: &[TunableParameter],
        regressed: bool,
        learning_rate: f64,
    ) -> Vec<Proposal>;
}

/// Gradient-free hill climbing with per-parameter direction memory.
///
/// Each parameter keeps walking in its current direction until a regression
/// flips it; exploration occasionally randomizes the direction so the search
/// does not wedge on a plateau.
pub struct HillClimb {
    directions: HashMap<String, f64>,
    exploration_rate: f64,
    rng: ChaCha8Rng,
}

impl HillClimb {
    pub fn new(exploration_rate: f64, seed: u64) -> Self {
        Self {
            directions: HashMap::new(),
            exploration_rate,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl TuningStrategy for HillClimb {
    fn name(&self) -> &'static str {
        "hill_climb"
    }

    fn propose(
        &mut self,
        parameters: &[TunableParameter],
        regressed: bool,
        learning_rate: f64,
    ) -> Vec<Proposal> {
        let mut proposals = Vec::new();
        for param in parameters {
            let exploring = self.rng.gen::<f64>() < self.exploration_rate;
            let direction = self
                .directions
                .entry(param.name.clone())
                .or_insert(1.0);
            if regressed {
                *direction = -*direction;
            }
            if exploring {
                *direction = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            }

            let value = match &param.value {
                // flags only flip under exploration, text never moves
                ParameterValue::Bool(flag) => {
                    if exploring {
                        ParameterValue::Bool(!flag)
                    } else {
                        continue;
                    }
                }
                ParameterValue::Text(_) => continue,
                current => {
                    let factor = *direction * param.sensitivity * learning_rate;
                    current
                        .step_by(&param.step, factor)
                        .clamp_to(&param.min, &param.max)
                }
            };
            if value != param.value {
                proposals.push(Proposal {
                    name: param.name.clone(),
                    value,
                });
            }
        }
        proposals
    }
}

/// Uniform random sampling inside each parameter's envelope
pub struct RandomSearch {
    rng: ChaCha8Rng,
    /// Probability of touching any given parameter per iteration
    sample_rate: f64,
}

impl RandomSearch {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            sample_rate: 0.5,
        }
    }
}

impl TuningStrategy for RandomSearch {
    fn name(&self) -> &'static str {
        "random_search"
    }

    fn propose(
        &mut self,
        parameters: &[TunableParameter],
        _regressed: bool,
        _learning_rate: f64,
    ) -> Vec<Proposal> {
        let mut proposals = Vec::new();
        for param in parameters {
            if self.rng.gen::<f64>() >= self.sample_rate {
                continue;
            }
            let value = match (&param.min, &param.max) {
                (ParameterValue::Int(lo), ParameterValue::Int(hi)) if lo <= hi => {
                    ParameterValue::Int(self.rng.gen_range(*lo..=*hi))
                }
                (ParameterValue::Float(lo), ParameterValue::Float(hi)) if lo <= hi => {
                    ParameterValue::Float(self.rng.gen_range(*lo..=*hi))
                }
                (ParameterValue::Duration(lo), ParameterValue::Duration(hi)) if lo <= hi => {
                    let secs = self.rng.gen_range(lo.as_secs_f64()..=hi.as_secs_f64());
                    ParameterValue::Duration(std::time::Duration::from_secs_f64(secs))
                }
                (ParameterValue::Bool(_), ParameterValue::Bool(_)) => {
                    ParameterValue::Bool(self.rng.gen_bool(0.5))
                }
                _ => continue,
            };
            if value != param.value {
                proposals.push(Proposal {
                    name: param.name.clone(),
                    value,
                });
            }
        }
        proposals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> Vec<TunableParameter> {
        vec![
            TunableParameter::int("workers", "engine", 100, 10, 1000, 10),
            TunableParameter::float("threshold", "cache", 0.7, 0.1, 0.95, 0.05),
            TunableParameter::duration(
                "idle_timeout",
                "pool",
                Duration::from_secs(300),
                Duration::from_secs(10),
                Duration::from_secs(3600),
                Duration::from_secs(30),
            ),
        ]
    }

    #[test]
    fn hill_climb_proposals_stay_in_bounds() {
        let mut strategy = HillClimb::new(0.1, 1);
        let mut current = params();
        for iteration in 0..100 {
            let proposals = strategy.propose(&current, iteration % 3 == 0, 0.5);
            for proposal in proposals {
                let param = current
                    .iter_mut()
                    .find(|p| p.name == proposal.name)
                    .unwrap();
                assert!(
                    proposal.value.within(&param.min, &param.max),
                    "{} escaped bounds: {}",
                    proposal.name,
                    proposal.value
                );
                param.value = proposal.value;
            }
        }
    }

    #[test]
    fn hill_climb_flips_direction_on_regression() {
        let mut strategy = HillClimb::new(0.0, 1);
        let current = params();
        let up = strategy.propose(&current, false, 1.0);
        let down = strategy.propose(&current, true, 1.0);
        let find = |set: &[Proposal]| {
            set.iter()
                .find(|p| p.name == "workers")
                .map(|p| p.value.clone())
        };
        assert_eq!(find(&up), Some(ParameterValue::Int(110)));
        assert_eq!(find(&down), Some(ParameterValue::Int(90)));
    }

    #[test]
    fn random_search_is_reproducible_and_bounded() {
        let run = || {
            let mut strategy = RandomSearch::new(99);
            let current = params();
            let mut all = Vec::new();
            for _ in 0..20 {
                for proposal in strategy.propose(&current, false, 0.1) {
                    assert!(proposal.value.within(&current[0].min, &current[0].max)
                        || !proposal.value.same_kind(&current[0].value));
                    all.push(format!("{}={}", proposal.name, proposal.value));
                }
            }
            all
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn text_parameters_are_never_proposed() {
        let mut current = params();
        current.push(TunableParameter::new(
            "policy",
            "cache",
            ParameterValue::Text("lru".into()),
            ParameterValue::Text("lru".into()),
            ParameterValue::Text("lru".into()),
            ParameterValue::Text("lru".into()),
        ));
        let mut hill = HillClimb::new(1.0, 5);
        let mut random = RandomSearch::new(5);
        for _ in 0..50 {
            for proposal in hill
                .propose(&current, false, 1.0)
                .into_iter()
                .chain(random.propose(&current, false, 1.0))
            {
                assert_ne!(proposal.name, "policy");
            }
        }
    }
}
