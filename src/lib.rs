//! # normshap - Shapley values of norms in normative systems
//!
//! A normative system maps norm ids to parameter sets that govern a
//! simulation model. Given a baseline system and a current system over the
//! same norms, `normshap` estimates how much of the change in the model's
//! value-function score is attributable to each individual norm.
//!
//! ## Core Concepts
//!
//! - **Normative system**: `NormId -> NormParams`, see [`NormativeSystem`]
//! - **Alignment**: Monte-Carlo mean score of roll-outs under a system
//! - **Coalition**: a subset of norms taken from the current system
//! - **Shapley value**: weighted mean marginal contribution over coalitions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use normshap::models::{CounterFactory, CounterModel};
//! use normshap::{NormParams, NormativeSystem, SamplingParams, ShapleyEstimator};
//!
//! let off = NormParams::new().with("active", false);
//! let on = NormParams::new().with("active", true);
//! let baseline = NormativeSystem::new().with("A", off.clone()).with("B", off);
//! let current = NormativeSystem::new().with("A", on.clone()).with("B", on);
//!
//! let estimator = ShapleyEstimator::new(CounterFactory, CounterModel::score as fn(&CounterModel) -> f64);
//! let phi = estimator.compute("A", &baseline, &current, SamplingParams::new(1, 1))?;
//! assert_eq!(phi, 1.0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod error;
pub mod norms;
pub mod value;

// Estimation
pub mod alignment;
pub mod coalition;
pub mod config;
pub mod executor;
pub mod model;
pub mod models;
pub mod shapley;

// Configuration store and request surface
pub mod store;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

pub use alignment::{AlignmentEstimator, TrialStreams};
pub use coalition::{enumerate, Coalition, CoalitionIter};
pub use config::{EstimatorConfig, SamplingMode, SamplingParams};
pub use error::{
    ErrorKind, ExecutorError, MismatchError, NormshapError, NormshapResult, ParameterError, ValidationError,
};
pub use executor::{CancelToken, InlineExecutor, TaskExecutor, WorkerPool};
pub use model::{ModelFactory, SimulationModel, StepError, TrialRng, ValueFunction};
pub use norms::{NormId, NormParams, NormPatch, NormativeSystem};
pub use shapley::{ShapleyEstimator, ShapleyReport};
pub use store::{ConfigSnapshot, NormativeConfigStore};
pub use transport::{ServiceResponse, ShapleyService};
pub use value::ParamValue;
