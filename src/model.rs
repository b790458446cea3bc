//! Pluggable simulation model capability.
//!
//! A user model is expressed through three traits:
//!
//! - [`ModelFactory`] constructs a fresh model for every roll-out. Whatever
//!   the model needs at construction time lives in the factory itself.
//! - [`SimulationModel::step`] advances the model one step under a fixed
//!   normative system.
//! - [`ValueFunction`] scores the final model state. Any
//!   `Fn(&Model) -> f64 + Send + Sync` closure qualifies.
//!
//! Randomness must come from the [`TrialRng`] handed to the factory and to
//! every step. Each trial owns its stream; models must not reach for a global
//! or shared generator, otherwise trials become correlated.

use thiserror::Error;

/// Random stream owned by a single trial.
pub type TrialRng = rand_chacha::ChaCha8Rng;

/// Error reported by a model step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepError {
    /// Human-readable description of the failure.
    pub message: String,
}

impl StepError {
    /// Creates a step error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A stateful simulation whose evolution is governed by norms.
pub trait SimulationModel {
    /// Advances the model by one step under `norms`.
    ///
    /// The full normative system is passed on every step so that models can
    /// react to norm changes while running.
    fn step(&mut self, norms: &crate::NormativeSystem, rng: &mut TrialRng) -> Result<(), StepError>;
}

/// Builds a fresh model instance per roll-out.
pub trait ModelFactory: Send + Sync + 'static {
    /// Model type produced by this factory.
    type Model: SimulationModel;

    /// Constructs a new model. Initial randomness must be drawn from `rng`.
    fn create(&self, rng: &mut TrialRng) -> Self::Model;
}

/// Value semantics function: degree of respect for a value in a final state.
pub trait ValueFunction<M>: Send + Sync + 'static {
    /// Scores the final state of a roll-out.
    fn evaluate(&self, model: &M) -> f64;
}

impl<M, F> ValueFunction<M> for F
where
    F: Fn(&M) -> f64 + Send + Sync + 'static,
{
    fn evaluate(&self, model: &M) -> f64 {
        self(model)
    }
}
