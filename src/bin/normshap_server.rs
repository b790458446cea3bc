//! normshap HTTP server
//!
//! Serves Shapley computations for one of the bundled reference models.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use normshap::models::{CounterFactory, CounterModel, DriftFactory, DriftModel};
use normshap::server::{serve, ServerError};
use normshap::{
    EstimatorConfig, ModelFactory, NormativeConfigStore, NormativeSystem, ShapleyEstimator, ShapleyService,
    ValueFunction,
};

const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ModelKind {
    Counter,
    Drift(DriftFactory),
}

/// Server configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
    /// Estimator settings (TOML)
    config_file: Option<PathBuf>,
    /// Initial baseline and current norms (JSON)
    norms_file: Option<PathBuf>,
    model: ModelKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            config_file: None,
            norms_file: None,
            model: ModelKind::Counter,
        }
    }
}

/// Initial store contents.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct InitialNorms {
    #[serde(alias = "baselineNorms")]
    baseline_norms: NormativeSystem,
    #[serde(alias = "normativeSystem")]
    normative_system: NormativeSystem,
}

fn fail(message: &str) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    args.get(i + 1)
        .cloned()
        .unwrap_or_else(|| fail(&format!("{flag} requires a value")))
}

fn parse_model(name: &str, drift: DriftFactory) -> ModelKind {
    match name {
        "counter" => ModelKind::Counter,
        "drift" => ModelKind::Drift(drift),
        other => fail(&format!("unknown model: {other} (expected counter or drift)")),
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();
    let mut model_name = String::from("counter");
    let mut drift = DriftFactory { noise: 0.5 };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                let raw = value_of(&args, i, "--port");
                let port: u16 = raw
                    .parse()
                    .unwrap_or_else(|_| fail(&format!("invalid port number: {raw}")));
                config.addr.set_port(port);
                i += 2;
            }
            "--config" | "-c" => {
                config.config_file = Some(PathBuf::from(value_of(&args, i, "--config")));
                i += 2;
            }
            "--norms" | "-n" => {
                config.norms_file = Some(PathBuf::from(value_of(&args, i, "--norms")));
                i += 2;
            }
            "--model" | "-m" => {
                model_name = value_of(&args, i, "--model");
                i += 2;
            }
            "--noise" => {
                let raw = value_of(&args, i, "--noise");
                let noise: f64 = raw
                    .parse()
                    .unwrap_or_else(|_| fail(&format!("invalid noise: {raw}")));
                drift = DriftFactory::new(noise).unwrap_or_else(|e| fail(&format!("invalid noise: {e}")));
                i += 2;
            }
            "--help" | "-h" => {
                println!("normshap-server - Shapley values of norms over HTTP");
                println!();
                println!("USAGE:");
                println!("    normshap-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -p, --port <PORT>       Port to listen on [default: {DEFAULT_PORT}]");
                println!("    -c, --config <FILE>     Estimator settings (TOML)");
                println!("    -n, --norms <FILE>      Initial baseline_norms / normative_system (JSON)");
                println!("    -m, --model <MODEL>     counter | drift [default: counter]");
                println!("        --noise <NOISE>     Drift model noise [default: 0.5]");
                println!("    -h, --help              Print help information");
                std::process::exit(0);
            }
            arg => fail(&format!("unknown argument: {arg}")),
        }
    }

    config.model = parse_model(&model_name, drift);
    config
}

fn load_estimator_config(path: Option<&PathBuf>) -> EstimatorConfig {
    match path {
        None => EstimatorConfig::default(),
        Some(path) => EstimatorConfig::from_toml_file(path)
            .unwrap_or_else(|e| fail(&format!("{}: {e}", path.display()))),
    }
}

fn load_norms(path: Option<&PathBuf>) -> InitialNorms {
    let Some(path) = path else {
        return InitialNorms::default();
    };
    let raw = std::fs::read(path).unwrap_or_else(|e| fail(&format!("{}: {e}", path.display())));
    serde_json::from_slice(&raw).unwrap_or_else(|e| fail(&format!("{}: {e}", path.display())))
}

async fn run<F, V>(
    addr: SocketAddr,
    factory: F,
    value: V,
    config: EstimatorConfig,
    norms: InitialNorms,
) -> Result<(), ServerError>
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    let sampling = config.sampling;
    let estimator =
        ShapleyEstimator::with_config(factory, value, config).unwrap_or_else(|e| fail(&e.to_string()));
    let store = NormativeConfigStore::new(norms.baseline_norms, norms.normative_system, sampling)
        .unwrap_or_else(|e| fail(&e.to_string()));
    if let Ok(Err(mismatch)) = store.check_consistency() {
        tracing::warn!(%mismatch, "initial norms are not consistent; stored computations will fail until patched");
    }
    serve(addr, Arc::new(ShapleyService::new(estimator, store))).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = parse_args();
    let estimator_config = load_estimator_config(config.config_file.as_ref());
    let norms = load_norms(config.norms_file.as_ref());

    tracing::info!(
        model = ?config.model,
        path_length = estimator_config.sampling.path_length,
        path_sample = estimator_config.sampling.path_sample,
        norms = norms.baseline_norms.len(),
        "starting normshap server"
    );

    let result = match config.model {
        ModelKind::Counter => {
            run(
                config.addr,
                CounterFactory,
                CounterModel::score as fn(&CounterModel) -> f64,
                estimator_config,
                norms,
            )
            .await
        }
        ModelKind::Drift(factory) => {
            run(
                config.addr,
                factory,
                DriftModel::score as fn(&DriftModel) -> f64,
                estimator_config,
                norms,
            )
            .await
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
