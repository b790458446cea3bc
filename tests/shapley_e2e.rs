//! End-to-end Shapley computations over the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use normshap::coalition::{binomial, shapley_weight};
use normshap::models::{CounterFactory, CounterModel, DriftFactory, DriftModel};
use normshap::{
    CancelToken, EstimatorConfig, ExecutorError, MismatchError, ModelFactory, NormId, NormParams, NormativeSystem,
    NormshapError, SamplingMode, SamplingParams, ShapleyEstimator, SimulationModel, StepError, TrialRng,
};

type CounterEstimator = ShapleyEstimator<CounterFactory, fn(&CounterModel) -> f64>;
type DriftEstimator = ShapleyEstimator<DriftFactory, fn(&DriftModel) -> f64>;

fn active(on: bool) -> NormParams {
    NormParams::new().with("active", on)
}

fn counter() -> CounterEstimator {
    ShapleyEstimator::new(CounterFactory, CounterModel::score as fn(&CounterModel) -> f64)
}

fn drift(noise: f64, seed: u64, mode: SamplingMode) -> DriftEstimator {
    let config = EstimatorConfig {
        seed: Some(seed),
        sampling_mode: mode,
        ..EstimatorConfig::default()
    };
    ShapleyEstimator::with_config(DriftFactory { noise }, DriftModel::score as fn(&DriftModel) -> f64, config)
        .unwrap()
}

fn systems(ids: &[&str], params_of: impl Fn(&str) -> NormParams) -> (NormativeSystem, NormativeSystem) {
    // The baseline carries the same parameters with every norm switched off.
    let baseline = ids
        .iter()
        .map(|id| (NormId::from(*id), params_of(*id).with("active", false)))
        .collect();
    let current = ids.iter().map(|id| (NormId::from(*id), params_of(*id))).collect();
    (baseline, current)
}

#[test]
fn two_counter_norms_each_contribute_one() {
    let (baseline, current) = systems(&["A", "B"], |_| active(true));
    let estimator = counter();
    let params = SamplingParams::new(1, 1);
    let a = estimator.compute("A", &baseline, &current, params).unwrap();
    let b = estimator.compute("B", &baseline, &current, params).unwrap();
    assert_eq!(a, 1.0);
    assert_eq!(b, 1.0);
}

#[test]
fn estimation_count_is_two_per_coalition() {
    for n in 1..=5usize {
        let ids: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let (baseline, current) = systems(&refs, |_| active(true));
        let report = counter()
            .compute_report("n0", &baseline, &current, SamplingParams::new(1, 2), &CancelToken::new())
            .unwrap();
        assert_eq!(report.estimations, 2 * (1u64 << (n - 1)), "n={n}");
        assert_eq!(report.coalitions, 1u64 << (n - 1));
    }
}

#[test]
fn coalition_weights_sum_to_one() {
    for n in 1..=12usize {
        let total: f64 = (0..n).map(|k| binomial(n - 1, k) * shapley_weight(n, k)).sum();
        assert!((total - 1.0).abs() < 1e-12, "n={n} total={total}");
    }
}

#[test]
fn efficiency_holds_exactly_for_deterministic_models() {
    let (baseline, current) = systems(&["a", "b", "c", "d"], |id| active(id != "c"));
    let estimator = counter();
    let params = SamplingParams::new(3, 1);

    let values = estimator.compute_all(&baseline, &current, params).unwrap();
    let total: f64 = values.values().sum();
    let gain = estimator.alignment(&current, params).unwrap() - estimator.alignment(&baseline, params).unwrap();
    assert!((total - gain).abs() < 1e-9, "total={total} gain={gain}");
    assert_eq!(values[&NormId::from("c")], 0.0);
}

#[test]
fn stochastic_efficiency_converges_with_more_samples() {
    let (baseline, current) = systems(&["a", "b"], |id| {
        NormParams::new()
            .with("active", true)
            .with("drift", if id == "a" { 0.5 } else { 1.5 })
    });
    // Ten steps of total drift 2.0; the noise has zero mean.
    let true_gain = 20.0;
    let seeds = 1..=8u64;

    let mean_error = |path_sample: usize| {
        let params = SamplingParams::new(10, path_sample);
        let mut total_error = 0.0;
        for seed in seeds.clone() {
            let estimator = drift(1.0, seed, SamplingMode::Independent);
            let sum: f64 = estimator.compute_all(&baseline, &current, params).unwrap().values().sum();
            // Under a fixed seed every configuration has one deterministic
            // estimate, so the values add up to the estimated gain exactly.
            let estimated_gain =
                estimator.alignment(&current, params).unwrap() - estimator.alignment(&baseline, params).unwrap();
            assert!((sum - estimated_gain).abs() < 1e-9, "seed={seed} sum={sum} gain={estimated_gain}");
            total_error += (sum - true_gain).abs();
        }
        total_error / 8.0
    };

    let small = mean_error(4);
    let large = mean_error(4000);
    assert!(large < 0.2, "large={large}");
    assert!(large < small, "large={large} small={small}");
}

#[test]
fn symmetric_norms_get_equal_values() {
    let (baseline, current) = systems(&["x", "y", "z"], |id| {
        NormParams::new()
            .with("active", true)
            .with("drift", if id == "z" { 5.0 } else { 2.0 })
    });
    let estimator = drift(0.0, 7, SamplingMode::Independent);
    let params = SamplingParams::new(4, 3);
    let x = estimator.compute("x", &baseline, &current, params).unwrap();
    let y = estimator.compute("y", &baseline, &current, params).unwrap();
    let z = estimator.compute("z", &baseline, &current, params).unwrap();
    assert!((x - y).abs() < 1e-9);
    assert!((x - 8.0).abs() < 1e-9);
    assert!((z - 20.0).abs() < 1e-9);
}

#[test]
fn null_player_has_zero_value() {
    let (baseline, current) = systems(&["on", "off", "also_on"], |id| active(id != "off"));
    let phi = counter()
        .compute("off", &baseline, &current, SamplingParams::new(5, 2))
        .unwrap();
    assert_eq!(phi, 0.0);
}

#[test]
fn deterministic_single_sample_is_bit_identical() {
    let (baseline, current) = systems(&["a", "b", "c"], |_| active(true));
    let estimator = counter();
    let params = SamplingParams::new(7, 1);
    let first = estimator.compute("b", &baseline, &current, params).unwrap();
    let second = estimator.compute("b", &baseline, &current, params).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
}

#[test]
fn seeded_stochastic_runs_are_reproducible() {
    let (baseline, current) = systems(&["a", "b"], |_| active(true));
    let params = SamplingParams::new(5, 64);
    for mode in [SamplingMode::Independent, SamplingMode::Paired] {
        let first = drift(1.0, 42, mode).compute("a", &baseline, &current, params).unwrap();
        let second = drift(1.0, 42, mode).compute("a", &baseline, &current, params).unwrap();
        assert_eq!(first.to_bits(), second.to_bits(), "{mode:?}");
    }
}

#[test]
fn paired_sampling_cancels_shared_noise() {
    // Under common random numbers the noise is identical in both halves of
    // every marginal contribution, so only the drift survives.
    let (baseline, current) = systems(&["a", "b"], |_| NormParams::new().with("active", true).with("drift", 0.25));
    let params = SamplingParams::new(10, 16);
    let phi = drift(3.0, 11, SamplingMode::Paired)
        .compute("a", &baseline, &current, params)
        .unwrap();
    assert!((phi - 2.5).abs() < 1e-9, "phi={phi}");
}

struct CountingFactory {
    created: Arc<AtomicUsize>,
}

impl ModelFactory for CountingFactory {
    type Model = CounterModel;

    fn create(&self, rng: &mut TrialRng) -> CounterModel {
        self.created.fetch_add(1, Ordering::SeqCst);
        CounterFactory.create(rng)
    }
}

#[test]
fn mismatched_configurations_run_no_simulation() {
    let created = Arc::new(AtomicUsize::new(0));
    let estimator = ShapleyEstimator::new(
        CountingFactory {
            created: Arc::clone(&created),
        },
        CounterModel::score as fn(&CounterModel) -> f64,
    );
    let params = SamplingParams::new(2, 4);

    let baseline = NormativeSystem::new().with("A", active(false)).with("B", active(false));
    let missing_norm = NormativeSystem::new().with("A", active(true));
    let err = estimator.compute("A", &baseline, &missing_norm, params).unwrap_err();
    assert!(matches!(
        err,
        NormshapError::ConfigMismatch(MismatchError::NormSet { .. })
    ));

    let extra_key = NormativeSystem::new()
        .with("A", active(true).with("rate", 0.5))
        .with("B", active(true));
    let err = estimator.compute("A", &baseline, &extra_key, params).unwrap_err();
    assert!(matches!(
        err,
        NormshapError::ConfigMismatch(MismatchError::ParamKeys { .. })
    ));

    assert_eq!(created.load(Ordering::SeqCst), 0);

    estimator
        .compute("A", &baseline, &baseline, params)
        .unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2 * 2 * 4);
}

#[test]
fn zero_path_sample_is_invalid() {
    let (baseline, current) = systems(&["a"], |_| active(true));
    let err = counter()
        .compute("a", &baseline, &current, SamplingParams::new(3, 0))
        .unwrap_err();
    assert!(err.is_precondition());
}

#[test]
fn zero_path_length_scores_initial_state() {
    let (baseline, current) = systems(&["a", "b"], |_| active(true));
    let phi = counter()
        .compute("a", &baseline, &current, SamplingParams::new(0, 3))
        .unwrap();
    assert_eq!(phi, 0.0);
}

struct Explosive;

impl SimulationModel for Explosive {
    fn step(&mut self, norms: &NormativeSystem, _rng: &mut TrialRng) -> Result<(), StepError> {
        if norms.get("boom").and_then(|p| p.get_bool("active")) == Some(true) {
            panic!("model exploded");
        }
        Ok(())
    }
}

struct ExplosiveFactory;

impl ModelFactory for ExplosiveFactory {
    type Model = Explosive;

    fn create(&self, _rng: &mut TrialRng) -> Explosive {
        Explosive
    }
}

#[test]
fn panicking_trial_surfaces_as_executor_error() {
    let (baseline, current) = systems(&["boom", "quiet"], |_| active(true));
    let estimator = ShapleyEstimator::new(ExplosiveFactory, |_: &Explosive| 0.0);
    let err = estimator
        .compute("quiet", &baseline, &current, SamplingParams::new(2, 4))
        .unwrap_err();
    assert!(matches!(
        err,
        NormshapError::Executor(ExecutorError::TrialPanicked { .. })
    ));
    assert!(!err.public_message().contains("exploded"));
}
