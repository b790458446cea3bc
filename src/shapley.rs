//! Shapley value of a norm.
//!
//! The Shapley value of norm `n` in a system of `N` norms is
//!
//! ```text
//! φ(n) = Σ_{S ⊆ N \ {n}} |S|! (N - |S| - 1)! / N! · (A(S ∪ {n}) - A(S))
//! ```
//!
//! where `A(S)` is the alignment of the hybrid system taking the norms in
//! `S` from the current system and every other norm from the baseline. Each
//! coalition costs two alignment estimates, so one computation runs
//! `2 · 2^(N-1)` of them, all on a single worker pool that lives exactly as
//! long as the computation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::alignment::{AlignmentEstimator, TrialStreams};
use crate::coalition::{self, coalition_count};
use crate::config::{EstimatorConfig, SamplingMode, SamplingParams};
use crate::error::{NormshapResult, ParameterError};
use crate::executor::{pool_size, CancelToken, TaskExecutor, WorkerPool};
use crate::model::{ModelFactory, ValueFunction};
use crate::norms::{NormId, NormativeSystem};
use crate::store::{ConfigSnapshot, NormativeConfigStore};

/// Outcome of a Shapley computation with run metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapleyReport {
    /// Identifier of this computation, also attached to its log records.
    pub run_id: Uuid,
    /// Norm whose contribution was computed.
    pub norm: NormId,
    /// The Shapley value.
    pub shapley: f64,
    /// Number of norms in the system.
    pub norm_count: usize,
    /// Coalitions visited (`2^(N-1)`).
    pub coalitions: u64,
    /// Alignment estimates performed (`2 · 2^(N-1)`).
    pub estimations: u64,
    /// Roll-outs simulated.
    pub trials: u64,
    /// Base seed of the trial streams, for reproduction.
    pub base_seed: u64,
    /// How trial streams were shared between configurations.
    pub sampling_mode: SamplingMode,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunCounters {
    coalitions: u64,
    estimations: u64,
    trials: u64,
}

/// Computes Shapley values of norms for one model and value function.
pub struct ShapleyEstimator<F, V> {
    alignment: AlignmentEstimator<F, V>,
    config: EstimatorConfig,
}

impl<F, V> ShapleyEstimator<F, V>
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    /// Creates an estimator with the default configuration.
    pub fn new(factory: F, value: V) -> Self {
        Self {
            alignment: AlignmentEstimator::new(factory, value),
            config: EstimatorConfig::default(),
        }
    }

    /// Creates an estimator with a validated configuration.
    pub fn with_config(factory: F, value: V, config: EstimatorConfig) -> Result<Self, ParameterError> {
        config.validate()?;
        Ok(Self {
            alignment: AlignmentEstimator::new(factory, value),
            config,
        })
    }

    /// Validated settings.
    #[must_use]
    pub const fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Underlying alignment estimator.
    #[must_use]
    pub const fn alignment_estimator(&self) -> &AlignmentEstimator<F, V> {
        &self.alignment
    }

    /// Shapley value of `target` between `baseline` and `current`.
    pub fn compute(
        &self,
        target: &str,
        baseline: &NormativeSystem,
        current: &NormativeSystem,
        params: SamplingParams,
    ) -> NormshapResult<f64> {
        self.compute_report(target, baseline, current, params, &CancelToken::new())
            .map(|report| report.shapley)
    }

    /// Shapley value of `target` over an immutable store snapshot.
    pub fn compute_snapshot(&self, target: &str, snapshot: &ConfigSnapshot) -> NormshapResult<f64> {
        self.compute(target, &snapshot.baseline, &snapshot.current, snapshot.sampling)
    }

    /// Takes a snapshot of `store` and computes over it. Later store updates
    /// do not affect the running computation.
    pub fn compute_from_store(&self, target: &str, store: &NormativeConfigStore) -> NormshapResult<f64> {
        let snapshot = store.get()?;
        self.compute_snapshot(target, &snapshot)
    }

    /// Shapley value of `target` with run metadata, cancellable via `cancel`.
    pub fn compute_report(
        &self,
        target: &str,
        baseline: &NormativeSystem,
        current: &NormativeSystem,
        params: SamplingParams,
        cancel: &CancelToken,
    ) -> NormshapResult<ShapleyReport> {
        let all_ids = self.prepare(baseline, current, params)?;
        let target = NormId::from(target);
        if !baseline.contains(target.as_str()) {
            return Err(ParameterError::UnknownNorm {
                norm: target.to_string(),
            }
            .into());
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("shapley", %run_id, norm = %target);
        let _guard = span.enter();

        let streams = TrialStreams::from_seed_or_random(self.config.seed, self.config.sampling_mode);
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            norms = all_ids.len(),
            coalitions = coalition_count(all_ids.len()),
            path_length = params.path_length,
            path_sample = params.path_sample,
            "shapley computation started"
        );

        let pool = self.open_executor(params)?;
        let mut counters = RunCounters::default();
        let shapley = self.shapley_of(
            &target, &all_ids, baseline, current, params, streams, &pool, cancel, &mut counters,
        )?;
        drop(pool);

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(shapley, elapsed_ms, estimations = counters.estimations, "shapley computation finished");

        Ok(ShapleyReport {
            run_id,
            norm: target,
            shapley,
            norm_count: all_ids.len(),
            coalitions: counters.coalitions,
            estimations: counters.estimations,
            trials: counters.trials,
            base_seed: streams.base_seed(),
            sampling_mode: streams.mode(),
            started_at,
            elapsed_ms,
        })
    }

    /// Shapley value of every norm, sharing one worker pool.
    pub fn compute_all(
        &self,
        baseline: &NormativeSystem,
        current: &NormativeSystem,
        params: SamplingParams,
    ) -> NormshapResult<BTreeMap<NormId, f64>> {
        let all_ids = self.prepare(baseline, current, params)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("shapley_all", %run_id);
        let _guard = span.enter();

        let streams = TrialStreams::from_seed_or_random(self.config.seed, self.config.sampling_mode);
        let pool = self.open_executor(params)?;
        let cancel = CancelToken::new();
        let mut counters = RunCounters::default();
        let mut values = BTreeMap::new();
        for target in &all_ids {
            let value = self.shapley_of(
                target, &all_ids, baseline, current, params, streams, &pool, &cancel, &mut counters,
            )?;
            values.insert(target.clone(), value);
        }
        info!(norms = all_ids.len(), estimations = counters.estimations, "all shapley values computed");
        Ok(values)
    }

    /// Alignment of a single configuration.
    pub fn alignment(&self, norms: &NormativeSystem, params: SamplingParams) -> NormshapResult<f64> {
        params.validate_within(self.config.max_path_sample)?;
        let streams = TrialStreams::from_seed_or_random(self.config.seed, self.config.sampling_mode);
        let pool = self.open_executor(params)?;
        self.alignment
            .estimate(&Arc::new(norms.clone()), params, streams, &pool, &CancelToken::new())
    }

    /// Fail-fast validation; returns the norm ids in order.
    fn prepare(
        &self,
        baseline: &NormativeSystem,
        current: &NormativeSystem,
        params: SamplingParams,
    ) -> NormshapResult<Vec<NormId>> {
        baseline.check_compatible(current)?;
        params.validate_within(self.config.max_path_sample)?;

        let n = baseline.len();
        if n == 0 {
            return Err(ParameterError::EmptySystem.into());
        }
        if n > self.config.max_norms {
            return Err(ParameterError::TooManyNorms {
                count: n,
                exponent: n - 1,
                max: self.config.max_norms,
            }
            .into());
        }
        if n > self.config.warn_norms {
            warn!(
                norms = n,
                coalitions = coalition_count(n),
                "large normative system: coalition count grows as 2^(N-1)"
            );
        }
        Ok(baseline.ids().cloned().collect())
    }

    fn open_executor(&self, params: SamplingParams) -> NormshapResult<WorkerPool> {
        let workers = pool_size(params.path_sample, self.config.max_workers);
        Ok(WorkerPool::start(workers, self.config.queue_capacity)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn shapley_of(
        &self,
        target: &NormId,
        all_ids: &[NormId],
        baseline: &NormativeSystem,
        current: &NormativeSystem,
        params: SamplingParams,
        streams: TrialStreams,
        executor: &dyn TaskExecutor,
        cancel: &CancelToken,
        counters: &mut RunCounters,
    ) -> NormshapResult<f64> {
        let mut shapley = 0.0f64;
        for coalition in coalition::enumerate(all_ids, target)? {
            let members: BTreeSet<&NormId> = coalition.members.iter().collect();
            let with = Arc::new(NormativeSystem::compose(baseline, current, |id| {
                id == target || members.contains(id)
            }));
            let without = Arc::new(NormativeSystem::compose(baseline, current, |id| {
                members.contains(id)
            }));

            let a1 = self.alignment.estimate(&with, params, streams, executor, cancel)?;
            let a2 = self.alignment.estimate(&without, params, streams, executor, cancel)?;
            let marginal = a1 - a2;
            shapley += coalition.weight * marginal;

            counters.coalitions += 1;
            counters.estimations += 2;
            counters.trials += 2 * params.path_sample as u64;
            debug!(
                size = coalition.size(),
                weight = coalition.weight,
                with = a1,
                without = a2,
                marginal,
                "coalition evaluated"
            );
        }
        Ok(shapley)
    }
}
