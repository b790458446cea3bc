//! Monte-Carlo alignment estimation.
//!
//! The alignment of a normative system is the expected value-function score
//! of the final state of a roll-out governed by that system. It is estimated
//! as the mean over `path_sample` independent roll-outs of `path_length`
//! steps each, dispatched as one batch to a [`TaskExecutor`].

use std::sync::Arc;

use rand::SeedableRng;
use tracing::error;

use crate::config::{SamplingMode, SamplingParams};
use crate::error::{ExecutorError, NormshapResult};
use crate::executor::{run_batch, CancelToken, TaskExecutor};
use crate::model::{ModelFactory, SimulationModel, TrialRng, ValueFunction};
use crate::norms::NormativeSystem;

const TRIAL_STREAM_CONTEXT: &str = "normshap 2024 trial stream v1";

/// Derivation of per-trial random streams.
///
/// Every trial gets its own ChaCha stream seeded from a hash of the base
/// seed and the trial index. In [`SamplingMode::Independent`] the hash also
/// covers the norm configuration, so different configurations never share
/// streams; in [`SamplingMode::Paired`] trial `i` replays the same stream
/// under every configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialStreams {
    base_seed: u64,
    mode: SamplingMode,
}

impl TrialStreams {
    /// Streams derived from `base_seed`.
    #[must_use]
    pub const fn new(base_seed: u64, mode: SamplingMode) -> Self {
        Self { base_seed, mode }
    }

    /// Uses `seed` when given, otherwise draws a fresh base seed.
    #[must_use]
    pub fn from_seed_or_random(seed: Option<u64>, mode: SamplingMode) -> Self {
        Self::new(seed.unwrap_or_else(rand::random), mode)
    }

    /// Base seed, as reported in run metadata.
    #[must_use]
    pub const fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// Sampling mode.
    #[must_use]
    pub const fn mode(&self) -> SamplingMode {
        self.mode
    }

    /// Seed of trial `trial` under the configuration with `fingerprint`.
    #[must_use]
    pub fn trial_seed(&self, fingerprint: &[u8; 32], trial: usize) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(TRIAL_STREAM_CONTEXT);
        hasher.update(&self.base_seed.to_le_bytes());
        if self.mode == SamplingMode::Independent {
            hasher.update(fingerprint);
        }
        hasher.update(&(trial as u64).to_le_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// Estimates the alignment of fixed norm configurations.
pub struct AlignmentEstimator<F, V> {
    factory: Arc<F>,
    value: Arc<V>,
}

impl<F, V> Clone for AlignmentEstimator<F, V> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            value: Arc::clone(&self.value),
        }
    }
}

impl<F, V> AlignmentEstimator<F, V>
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    /// Creates an estimator for models built by `factory`, scored by `value`.
    pub fn new(factory: F, value: V) -> Self {
        Self {
            factory: Arc::new(factory),
            value: Arc::new(value),
        }
    }

    /// Returns the model factory.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Estimates the alignment of `norms`.
    ///
    /// Blocks until all `path_sample` trials completed. Any failing trial
    /// fails the whole estimate; there is no partial averaging.
    pub fn estimate(
        &self,
        norms: &Arc<NormativeSystem>,
        params: SamplingParams,
        streams: TrialStreams,
        executor: &dyn TaskExecutor,
        cancel: &CancelToken,
    ) -> NormshapResult<f64> {
        params.validate()?;

        let fingerprint = norms.fingerprint();
        let factory = Arc::clone(&self.factory);
        let value = Arc::clone(&self.value);
        let norms = Arc::clone(norms);
        let path_length = params.path_length;

        let scores = run_batch(executor, params.path_sample, cancel, move |trial| {
            let mut rng = TrialRng::from_seed(streams.trial_seed(&fingerprint, trial));
            let mut model = factory.create(&mut rng);
            for step in 0..path_length {
                model
                    .step(&norms, &mut rng)
                    .map_err(|e| ExecutorError::StepFailed {
                        trial,
                        step,
                        message: e.message,
                    })?;
            }
            let score = value.evaluate(&model);
            if !score.is_finite() {
                return Err(ExecutorError::NonFiniteScore { trial });
            }
            Ok(score)
        })
        .map_err(|e| {
            if e != ExecutorError::Cancelled {
                error!(error = %e, "alignment estimate failed");
            }
            e
        })?;

        // Summed in trial order: completion order never changes the result.
        let total: f64 = scores.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        Ok(total / params.path_sample as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand::Rng;

    use crate::error::{NormshapError, ParameterError};
    use crate::executor::{InlineExecutor, WorkerPool};
    use crate::model::StepError;
    use crate::norms::NormParams;

    struct Noisy {
        total: f64,
    }

    impl SimulationModel for Noisy {
        fn step(&mut self, _norms: &NormativeSystem, rng: &mut TrialRng) -> Result<(), StepError> {
            self.total += rng.gen::<f64>();
            Ok(())
        }
    }

    struct NoisyFactory {
        created: Arc<AtomicUsize>,
    }

    impl ModelFactory for NoisyFactory {
        type Model = Noisy;

        fn create(&self, _rng: &mut TrialRng) -> Noisy {
            self.created.fetch_add(1, Ordering::SeqCst);
            Noisy { total: 0.0 }
        }
    }

    fn noisy() -> (AlignmentEstimator<NoisyFactory, fn(&Noisy) -> f64>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = NoisyFactory {
            created: Arc::clone(&created),
        };
        let value: fn(&Noisy) -> f64 = |m| m.total;
        (AlignmentEstimator::new(factory, value), created)
    }

    fn norms() -> Arc<NormativeSystem> {
        Arc::new(NormativeSystem::new().with("n", NormParams::new().with("active", true)))
    }

    #[test]
    fn runs_one_model_per_trial() {
        let (estimator, created) = noisy();
        let streams = TrialStreams::new(1, SamplingMode::Independent);
        let mean = estimator
            .estimate(&norms(), SamplingParams::new(4, 50), streams, &InlineExecutor, &CancelToken::new())
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 50);
        // Four uniform draws per trial: mean close to 2.
        assert!(mean > 1.0 && mean < 3.0, "mean={mean}");
    }

    #[test]
    fn zero_sample_is_rejected_before_dispatch() {
        let (estimator, created) = noisy();
        let streams = TrialStreams::new(1, SamplingMode::Independent);
        let err = estimator
            .estimate(&norms(), SamplingParams::new(4, 0), streams, &InlineExecutor, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            NormshapError::InvalidParameter(ParameterError::NotPositive { .. })
        ));
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_length_scores_initial_state() {
        let (estimator, _) = noisy();
        let streams = TrialStreams::new(1, SamplingMode::Independent);
        let mean = estimator
            .estimate(&norms(), SamplingParams::new(0, 3), streams, &InlineExecutor, &CancelToken::new())
            .unwrap();
        assert!(mean.abs() < f64::EPSILON);
    }

    #[test]
    fn seeded_estimates_are_reproducible_across_executors() {
        let (estimator, _) = noisy();
        let streams = TrialStreams::new(99, SamplingMode::Independent);
        let params = SamplingParams::new(3, 40);
        let inline = estimator
            .estimate(&norms(), params, streams, &InlineExecutor, &CancelToken::new())
            .unwrap();
        let pool = WorkerPool::start(4, 8).unwrap();
        let pooled = estimator
            .estimate(&norms(), params, streams, &pool, &CancelToken::new())
            .unwrap();
        assert_eq!(inline.to_bits(), pooled.to_bits());
    }

    #[test]
    fn trial_streams_differ_per_trial_and_configuration() {
        let independent = TrialStreams::new(5, SamplingMode::Independent);
        let paired = TrialStreams::new(5, SamplingMode::Paired);
        let a = [1u8; 32];
        let b = [2u8; 32];

        assert_ne!(independent.trial_seed(&a, 0), independent.trial_seed(&a, 1));
        assert_ne!(independent.trial_seed(&a, 0), independent.trial_seed(&b, 0));
        assert_eq!(paired.trial_seed(&a, 0), paired.trial_seed(&b, 0));
        assert_ne!(paired.trial_seed(&a, 0), paired.trial_seed(&a, 1));
    }

    #[test]
    fn step_failure_fails_the_estimate() {
        struct Fragile;
        impl SimulationModel for Fragile {
            fn step(&mut self, _norms: &NormativeSystem, _rng: &mut TrialRng) -> Result<(), StepError> {
                Err(StepError::new("invariant broken"))
            }
        }
        struct FragileFactory;
        impl ModelFactory for FragileFactory {
            type Model = Fragile;
            fn create(&self, _rng: &mut TrialRng) -> Fragile {
                Fragile
            }
        }

        let estimator = AlignmentEstimator::new(FragileFactory, |_: &Fragile| 1.0);
        let err = estimator
            .estimate(
                &norms(),
                SamplingParams::new(2, 5),
                TrialStreams::new(0, SamplingMode::Independent),
                &InlineExecutor,
                &CancelToken::new(),
            )
            .unwrap_err();
        let NormshapError::Executor(ExecutorError::StepFailed { trial, step, message }) = err else {
            panic!("expected StepFailed, got {err:?}");
        };
        assert_eq!((trial, step), (0, 0));
        assert_eq!(message, "invariant broken");
    }

    #[test]
    fn non_finite_scores_are_rejected() {
        let (base, _) = noisy();
        let estimator = AlignmentEstimator {
            factory: Arc::clone(&base.factory),
            value: Arc::new(|_: &Noisy| f64::NAN),
        };
        let err = estimator
            .estimate(
                &norms(),
                SamplingParams::new(1, 2),
                TrialStreams::new(0, SamplingMode::Independent),
                &InlineExecutor,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            NormshapError::Executor(ExecutorError::NonFiniteScore { trial: 0 })
        ));
    }
}
