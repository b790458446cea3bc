//! Copy-on-write configuration store.
//!
//! The store holds the baseline and current normative systems plus the
//! sampling parameters used by stored-config computations. Readers take an
//! `Arc` snapshot; writers build a new snapshot and swap it in. A computation
//! that started from a snapshot is never affected by later updates, and no
//! lock is held while computing.
//!
//! Patches are permissive: they may introduce norms or parameters that the
//! other system lacks. Keeping baseline and current compatible is the
//! caller's responsibility; the estimator rejects incompatible snapshots.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SamplingParams;
use crate::error::{MismatchError, NormshapError, NormshapResult, ParameterError};
use crate::norms::{NormPatch, NormativeSystem};

fn lock_err(context: &'static str) -> NormshapError {
    NormshapError::internal(format!("poisoned lock: {context}"))
}

/// Immutable view of the store at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    /// Baseline norms.
    pub baseline: NormativeSystem,
    /// Current norms.
    pub current: NormativeSystem,
    /// Stored sampling parameters.
    pub sampling: SamplingParams,
    /// Incremented by every successful update.
    pub version: u64,
    /// Time of the last update.
    pub updated_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    /// Stored roll-out length.
    #[must_use]
    pub const fn path_length(&self) -> usize {
        self.sampling.path_length
    }

    /// Stored number of roll-outs.
    #[must_use]
    pub const fn path_sample(&self) -> usize {
        self.sampling.path_sample
    }
}

/// Shared, concurrently updatable normative configuration.
#[derive(Debug)]
pub struct NormativeConfigStore {
    state: RwLock<Arc<ConfigSnapshot>>,
}

impl NormativeConfigStore {
    /// Creates a store. Sampling parameters must be positive.
    pub fn new(
        baseline: NormativeSystem,
        current: NormativeSystem,
        sampling: SamplingParams,
    ) -> Result<Self, ParameterError> {
        require_positive("path_length", sampling.path_length)?;
        require_positive("path_sample", sampling.path_sample)?;
        Ok(Self {
            state: RwLock::new(Arc::new(ConfigSnapshot {
                baseline,
                current,
                sampling,
                version: 0,
                updated_at: Utc::now(),
            })),
        })
    }

    /// Returns the current snapshot.
    pub fn get(&self) -> NormshapResult<Arc<ConfigSnapshot>> {
        let guard = self.state.read().map_err(|_| lock_err("config store"))?;
        Ok(Arc::clone(&guard))
    }

    /// Shallow per-norm merge into the baseline system.
    pub fn patch_baseline(&self, patch: &NormPatch) -> NormshapResult<Arc<ConfigSnapshot>> {
        self.update("baseline", |snapshot| snapshot.baseline.merge_patch(patch))
    }

    /// Shallow per-norm merge into the current system.
    pub fn patch_current(&self, patch: &NormPatch) -> NormshapResult<Arc<ConfigSnapshot>> {
        self.update("current", |snapshot| snapshot.current.merge_patch(patch))
    }

    /// Replaces the roll-out length. Must be positive.
    pub fn set_path_length(&self, path_length: usize) -> NormshapResult<Arc<ConfigSnapshot>> {
        require_positive("path_length", path_length)?;
        self.update("path_length", |snapshot| snapshot.sampling.path_length = path_length)
    }

    /// Replaces the roll-out sample size. Must be positive.
    pub fn set_path_sample(&self, path_sample: usize) -> NormshapResult<Arc<ConfigSnapshot>> {
        require_positive("path_sample", path_sample)?;
        self.update("path_sample", |snapshot| snapshot.sampling.path_sample = path_sample)
    }

    /// Checks whether the current snapshot is usable by the estimator.
    pub fn check_consistency(&self) -> NormshapResult<Result<(), MismatchError>> {
        let snapshot = self.get()?;
        Ok(snapshot.baseline.check_compatible(&snapshot.current))
    }

    fn update(
        &self,
        what: &'static str,
        apply: impl FnOnce(&mut ConfigSnapshot),
    ) -> NormshapResult<Arc<ConfigSnapshot>> {
        let mut guard = self.state.write().map_err(|_| lock_err("config store"))?;
        let mut next = ConfigSnapshot::clone(&guard);
        apply(&mut next);
        next.version += 1;
        next.updated_at = Utc::now();

        if let Err(mismatch) = next.baseline.check_compatible(&next.current) {
            warn!(field = what, version = next.version, %mismatch, "store is no longer consistent");
        }
        debug!(field = what, version = next.version, "config store updated");

        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        Ok(next)
    }
}

fn require_positive(name: &str, value: usize) -> Result<(), ParameterError> {
    if value == 0 {
        return Err(ParameterError::NotPositive {
            name: name.to_string(),
        });
    }
    Ok(())
}
