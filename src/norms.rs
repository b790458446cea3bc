//! Norms and normative systems.
//!
//! A normative system maps norm identifiers to their parameter bags. The
//! Shapley estimator works with two of them, a *baseline* that causes no
//! behavioral deviation and a *current* one, and composes hybrid systems by
//! picking each norm from one or the other.

use std::borrow::Borrow;
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::MismatchError;
use crate::value::ParamValue;

/// Unique identifier of a norm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormId(String);

impl NormId {
    /// Creates a norm identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NormId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NormId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NormId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NormId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Ordered parameter bag of a single norm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormParams(BTreeMap<String, ParamValue>);

impl NormParams {
    /// Creates an empty parameter bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Inserts or overwrites a parameter.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Option<ParamValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Value of `key`, if set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    /// Reads a boolean parameter, `None` if absent or of another type.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(ParamValue::as_bool)
    }

    /// Reads a numeric parameter, accepting integers as floats.
    #[must_use]
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(ParamValue::as_float)
    }

    /// Parameter names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shallow merge: keys from `other` are added or overwrite existing ones.
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl FromIterator<(String, ParamValue)> for NormParams {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A normative system: norm id to parameters, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormativeSystem(BTreeMap<NormId, NormParams>);

/// Partial update applied to a normative system by shallow per-id merge.
pub type NormPatch = NormativeSystem;

impl NormativeSystem {
    /// Creates an empty normative system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, id: impl Into<NormId>, params: NormParams) -> Self {
        self.0.insert(id.into(), params);
        self
    }

    /// Adds or replaces a norm, returning the previous parameters.
    pub fn insert(&mut self, id: impl Into<NormId>, params: NormParams) -> Option<NormParams> {
        self.0.insert(id.into(), params)
    }

    /// Parameters of norm `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&NormParams> {
        self.0.get(id)
    }

    /// Whether norm `id` is present.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// Norm identifiers in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &NormId> {
        self.0.keys()
    }

    /// Norms in id order.
    pub fn iter(&self) -> btree_map::Iter<'_, NormId, NormParams> {
        self.0.iter()
    }

    /// Number of norms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the system has no norms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies a patch: for every norm in `patch`, merges its parameters into
    /// the existing ones. Unknown norms are inserted as-is.
    pub fn merge_patch(&mut self, patch: &NormPatch) {
        for (id, params) in &patch.0 {
            self.0.entry(id.clone()).or_default().merge(params);
        }
    }

    /// Checks that `other` has the same norms, each with the same parameter keys.
    pub fn check_compatible(&self, other: &Self) -> Result<(), MismatchError> {
        let missing_in_other = missing_keys(self.0.keys(), &other.0);
        let missing_in_self = missing_keys(other.0.keys(), &self.0);
        if !missing_in_other.is_empty() || !missing_in_self.is_empty() {
            return Err(MismatchError::NormSet {
                missing_in_current: missing_in_other,
                missing_in_baseline: missing_in_self,
            });
        }

        for (id, params) in &self.0 {
            let Some(other_params) = other.0.get(id) else {
                continue;
            };
            let mine: BTreeSet<&str> = params.keys().collect();
            let theirs: BTreeSet<&str> = other_params.keys().collect();
            if mine != theirs {
                return Err(MismatchError::ParamKeys {
                    norm: id.to_string(),
                    missing_in_current: mine.difference(&theirs).map(|k| (*k).to_string()).collect(),
                    missing_in_baseline: theirs.difference(&mine).map(|k| (*k).to_string()).collect(),
                });
            }
        }
        Ok(())
    }

    /// Builds a hybrid system over the norms of `baseline`: norms for which
    /// `from_current` holds take their parameters from `current`, the rest
    /// keep the baseline parameters.
    ///
    /// Both systems must already be compatible.
    #[must_use]
    pub fn compose(baseline: &Self, current: &Self, from_current: impl Fn(&NormId) -> bool) -> Self {
        let norms = baseline
            .0
            .iter()
            .map(|(id, bsl)| {
                let params = if from_current(id) {
                    current.0.get(id).unwrap_or(bsl)
                } else {
                    bsl
                };
                (id.clone(), params.clone())
            })
            .collect();
        Self(norms)
    }

    /// Stable content hash of the system.
    ///
    /// Equal systems hash equally regardless of insertion order; integers and
    /// floats with the same printed value hash differently.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.0.len() as u64).to_le_bytes());
        for (id, params) in &self.0 {
            hash_str(&mut hasher, id.as_str());
            hasher.update(&(params.len() as u64).to_le_bytes());
            for (key, value) in params.iter() {
                hash_str(&mut hasher, key);
                hash_str(&mut hasher, value.type_name());
                hash_str(&mut hasher, &value.to_string());
            }
        }
        *hasher.finalize().as_bytes()
    }
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn missing_keys<'a>(
    keys: impl Iterator<Item = &'a NormId>,
    other: &BTreeMap<NormId, NormParams>,
) -> Vec<String> {
    keys.filter(|k| !other.contains_key(*k))
        .map(ToString::to_string)
        .collect()
}

impl FromIterator<(NormId, NormParams)> for NormativeSystem {
    fn from_iter<I: IntoIterator<Item = (NormId, NormParams)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a NormativeSystem {
    type Item = (&'a NormId, &'a NormParams);
    type IntoIter = btree_map::Iter<'a, NormId, NormParams>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(on: bool) -> NormParams {
        NormParams::new().with("active", on)
    }

    fn pair(a: bool, b: bool) -> NormativeSystem {
        NormativeSystem::new().with("A", active(a)).with("B", active(b))
    }

    #[test]
    fn compatible_systems_pass() {
        pair(false, false).check_compatible(&pair(true, true)).unwrap();
    }

    #[test]
    fn missing_norm_is_reported() {
        let baseline = pair(false, false);
        let current = NormativeSystem::new().with("A", active(true)).with("C", active(true));
        let err = baseline.check_compatible(&current).unwrap_err();
        assert_eq!(
            err,
            MismatchError::NormSet {
                missing_in_current: vec!["B".to_string()],
                missing_in_baseline: vec!["C".to_string()],
            }
        );
    }

    #[test]
    fn differing_param_keys_are_reported() {
        let baseline = pair(false, false);
        let current = NormativeSystem::new()
            .with("A", active(true))
            .with("B", active(true).with("rate", 0.5));
        let err = baseline.check_compatible(&current).unwrap_err();
        let MismatchError::ParamKeys { norm, missing_in_baseline, .. } = err else {
            panic!("expected ParamKeys, got {err:?}");
        };
        assert_eq!(norm, "B");
        assert_eq!(missing_in_baseline, vec!["rate".to_string()]);
    }

    #[test]
    fn compose_picks_per_norm() {
        let baseline = pair(false, false);
        let current = pair(true, true);
        let hybrid = NormativeSystem::compose(&baseline, &current, |id| id.as_str() == "A");
        assert_eq!(hybrid.get("A").unwrap().get_bool("active"), Some(true));
        assert_eq!(hybrid.get("B").unwrap().get_bool("active"), Some(false));
        assert_eq!(hybrid.len(), 2);
    }

    #[test]
    fn merge_patch_is_shallow_and_permissive() {
        let mut system = NormativeSystem::new().with("A", active(false).with("rate", 0.1));
        let patch = NormativeSystem::new()
            .with("A", NormParams::new().with("active", true))
            .with("Z", NormParams::new().with("new", 1));
        system.merge_patch(&patch);

        let a = system.get("A").unwrap();
        assert_eq!(a.get_bool("active"), Some(true));
        assert_eq!(a.get_float("rate"), Some(0.1));
        assert_eq!(system.get("Z").unwrap().get("new"), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn fingerprint_depends_on_content_only() {
        let a = pair(true, false);
        let b = NormativeSystem::new().with("B", active(false)).with("A", active(true));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), pair(false, true).fingerprint());

        let int = NormativeSystem::new().with("A", NormParams::new().with("x", 1));
        let float = NormativeSystem::new().with("A", NormParams::new().with("x", 1.0));
        assert_ne!(int.fingerprint(), float.fingerprint());
    }

    #[test]
    fn deserializes_from_plain_json() {
        let system: NormativeSystem =
            serde_json::from_str(r#"{"A": {"active": true, "rate": 0.5}, "B": {}}"#).unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system.get("A").unwrap().get_float("rate"), Some(0.5));
        assert!(system.get("B").unwrap().is_empty());
        let ids: Vec<&str> = system.ids().map(NormId::as_str).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }
}
