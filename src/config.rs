//! Estimator configuration and sampling parameters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ParameterError;

/// Default number of steps per roll-out.
pub const DEFAULT_PATH_LENGTH: usize = 10;

/// Default number of roll-outs per alignment estimate.
pub const DEFAULT_PATH_SAMPLE: usize = 500;

/// Default upper bound on roll-outs per alignment estimate.
pub const DEFAULT_MAX_PATH_SAMPLE: usize = 1_000_000;

/// How trial random streams relate across norm configurations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Every configuration draws its own streams.
    #[default]
    Independent,
    /// Trial `i` uses the same stream under every configuration (common
    /// random numbers), which lowers the variance of marginal contributions.
    Paired,
}

/// Roll-out length and sample size for one alignment estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Steps per roll-out. Zero scores the initial model state.
    pub path_length: usize,
    /// Roll-outs per estimate. Must be at least one.
    pub path_sample: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            path_length: DEFAULT_PATH_LENGTH,
            path_sample: DEFAULT_PATH_SAMPLE,
        }
    }
}

impl SamplingParams {
    /// Creates sampling parameters without validating them.
    #[must_use]
    pub const fn new(path_length: usize, path_sample: usize) -> Self {
        Self {
            path_length,
            path_sample,
        }
    }

    /// Rejects a zero `path_sample`. A zero `path_length` is allowed.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.path_sample == 0 {
            return Err(ParameterError::NotPositive {
                name: "path_sample".to_string(),
            });
        }
        Ok(())
    }

    /// Like [`validate`](Self::validate), and also bounds `path_sample` by
    /// `max_path_sample`.
    pub fn validate_within(&self, max_path_sample: usize) -> Result<(), ParameterError> {
        self.validate()?;
        if self.path_sample > max_path_sample {
            return Err(ParameterError::TooLarge {
                name: "path_sample".to_string(),
                value: self.path_sample,
                max: max_path_sample,
            });
        }
        Ok(())
    }
}

/// Estimator-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimatorConfig {
    /// Default sampling parameters (used to seed the config store).
    pub sampling: SamplingParams,
    /// Base seed for trial streams. `None` draws a fresh seed per computation.
    pub seed: Option<u64>,
    /// Stream pairing across configurations.
    pub sampling_mode: SamplingMode,
    /// Upper bound on worker threads, on top of the sample-size bound.
    pub max_workers: Option<usize>,
    /// Capacity of the worker queue.
    pub queue_capacity: usize,
    /// Hard cap on the number of norms (coalitions grow as 2^(N-1)).
    pub max_norms: usize,
    /// Norm count above which a warning is logged.
    pub warn_norms: usize,
    /// Largest accepted `path_sample`, for stored and inline requests alike.
    pub max_path_sample: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            seed: None,
            sampling_mode: SamplingMode::Independent,
            max_workers: None,
            queue_capacity: 1024,
            max_norms: 20,
            warn_norms: 12,
            max_path_sample: DEFAULT_MAX_PATH_SAMPLE,
        }
    }
}

impl EstimatorConfig {
    /// Validate the configuration.
    ///
    /// Must be called before constructing an estimator from it.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.max_path_sample == 0 {
            return Err(invalid("max_path_sample must be > 0"));
        }
        self.sampling.validate_within(self.max_path_sample)?;
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be > 0"));
        }
        if self.max_workers == Some(0) {
            return Err(invalid("max_workers must be > 0"));
        }
        if self.max_norms == 0 {
            return Err(invalid("max_norms must be > 0"));
        }
        // 2^(max_norms - 1) coalitions must stay countable.
        if self.max_norms > 63 {
            return Err(invalid("max_norms must be <= 63"));
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ParameterError> {
        let config: Self = toml::from_str(s).map_err(|e| ParameterError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ParameterError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ParameterError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }
}

fn invalid(reason: &str) -> ParameterError {
    ParameterError::InvalidConfig {
        reason: reason.to_string(),
    }
}
