//! Reference models.
//!
//! Small models used by the test suite, the benches and the server binary.
//! Both read the boolean parameter `active` of every norm; inactive norms
//! have no effect, which makes a system of inactive norms a natural baseline.

use rand::Rng;

use crate::error::ParameterError;
use crate::model::{ModelFactory, SimulationModel, StepError, TrialRng};
use crate::norms::{NormParams, NormativeSystem};

fn is_active(params: &NormParams) -> bool {
    params.get_bool("active").unwrap_or(false)
}

/// Deterministic model: a counter incremented once per active norm per step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterModel {
    counter: u64,
}

impl CounterModel {
    /// Current counter value.
    #[must_use]
    pub const fn counter(&self) -> u64 {
        self.counter
    }

    /// Value function: the final counter.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self) -> f64 {
        self.counter as f64
    }
}

impl SimulationModel for CounterModel {
    fn step(&mut self, norms: &NormativeSystem, _rng: &mut TrialRng) -> Result<(), StepError> {
        let active = norms.iter().filter(|(_, params)| is_active(params)).count() as u64;
        self.counter = self
            .counter
            .checked_add(active)
            .ok_or_else(|| StepError::new("counter overflow"))?;
        Ok(())
    }
}

/// Builds [`CounterModel`]s starting at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterFactory;

impl ModelFactory for CounterFactory {
    type Model = CounterModel;

    fn create(&self, _rng: &mut TrialRng) -> CounterModel {
        CounterModel::default()
    }
}

/// Stochastic model: a position pushed by active norms and shaken by noise.
///
/// Each step, every active norm moves the position by its `drift` parameter
/// (default `1.0`), then uniform noise in `[-noise, noise]` is added.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftModel {
    position: f64,
    noise: f64,
}

impl DriftModel {
    /// Current position.
    #[must_use]
    pub const fn position(&self) -> f64 {
        self.position
    }

    /// Value function: the final position.
    #[must_use]
    pub const fn score(&self) -> f64 {
        self.position
    }
}

impl SimulationModel for DriftModel {
    fn step(&mut self, norms: &NormativeSystem, rng: &mut TrialRng) -> Result<(), StepError> {
        for (id, params) in norms {
            if !is_active(params) {
                continue;
            }
            let drift = match params.get("drift") {
                None => 1.0,
                Some(v) => v
                    .as_float()
                    .ok_or_else(|| StepError::new(format!("norm '{id}': drift must be numeric")))?,
            };
            self.position += drift;
        }
        if self.noise > 0.0 {
            self.position += rng.gen_range(-self.noise..=self.noise);
        }
        Ok(())
    }
}

/// Builds [`DriftModel`]s with a random start in `[-noise, noise]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftFactory {
    /// Half-width of the uniform noise, also used for the start position.
    pub noise: f64,
}

impl DriftFactory {
    /// Checked constructor. The noise must be finite, non-negative and small
    /// enough that the width of `[-noise, noise]` is itself finite.
    pub fn new(noise: f64) -> Result<Self, ParameterError> {
        if !noise.is_finite() || noise < 0.0 || !(2.0 * noise).is_finite() {
            return Err(ParameterError::InvalidConfig {
                reason: format!("noise must be finite and non-negative, got {noise}"),
            });
        }
        Ok(Self { noise })
    }
}

impl ModelFactory for DriftFactory {
    type Model = DriftModel;

    fn create(&self, rng: &mut TrialRng) -> DriftModel {
        let position = if self.noise > 0.0 {
            rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        DriftModel {
            position,
            noise: self.noise,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    fn rng() -> TrialRng {
        TrialRng::seed_from_u64(42)
    }

    #[test]
    fn counter_counts_active_norms() {
        let norms = NormativeSystem::new()
            .with("A", NormParams::new().with("active", true))
            .with("B", NormParams::new().with("active", false))
            .with("C", NormParams::new().with("active", true));
        let mut rng = rng();
        let mut model = CounterFactory.create(&mut rng);
        model.step(&norms, &mut rng).unwrap();
        model.step(&norms, &mut rng).unwrap();
        assert_eq!(model.counter(), 4);
        assert!((model.score() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn norms_without_active_flag_are_inactive() {
        let norms = NormativeSystem::new().with("A", NormParams::new().with("rate", 0.3));
        let mut rng = rng();
        let mut model = CounterFactory.create(&mut rng);
        model.step(&norms, &mut rng).unwrap();
        assert_eq!(model.counter(), 0);
    }

    #[test]
    fn noiseless_drift_is_deterministic() {
        let norms = NormativeSystem::new()
            .with("up", NormParams::new().with("active", true).with("drift", 2.5))
            .with("down", NormParams::new().with("active", true).with("drift", -1))
            .with("off", NormParams::new().with("active", false).with("drift", 100.0));
        let mut rng = rng();
        let mut model = DriftFactory { noise: 0.0 }.create(&mut rng);
        for _ in 0..4 {
            model.step(&norms, &mut rng).unwrap();
        }
        assert!((model.position() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn noisy_drift_stays_within_bounds() {
        let norms = NormativeSystem::new().with("A", NormParams::new().with("active", false));
        let mut rng = rng();
        let mut model = DriftFactory { noise: 0.5 }.create(&mut rng);
        assert!(model.position().abs() <= 0.5);
        model.step(&norms, &mut rng).unwrap();
        assert!(model.position().abs() <= 1.0);
    }

    #[test]
    fn noise_range_must_have_finite_width() {
        assert!(DriftFactory::new(1e308).is_err());
        assert!(DriftFactory::new(f64::INFINITY).is_err());
        assert!(DriftFactory::new(f64::NAN).is_err());
        assert!(DriftFactory::new(-0.1).is_err());
        assert_eq!(DriftFactory::new(0.5).unwrap(), DriftFactory { noise: 0.5 });
        assert_eq!(DriftFactory::new(0.0).unwrap().noise, 0.0);
    }

    #[test]
    fn non_numeric_drift_fails_the_step() {
        let norms = NormativeSystem::new().with(
            "A",
            NormParams::new().with("active", true).with("drift", "fast"),
        );
        let mut rng = rng();
        let mut model = DriftFactory { noise: 0.0 }.create(&mut rng);
        let err = model.step(&norms, &mut rng).unwrap_err();
        assert!(err.message.contains("drift must be numeric"));
    }
}
