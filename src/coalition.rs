//! Coalition enumeration with exact Shapley weights.
//!
//! For a target norm among `N` norms, every subset `S` of the other `N - 1`
//! norms is a coalition, weighted by `|S|! (N - |S| - 1)! / N!`. There are
//! `2^(N-1)` of them, so cost is exponential in `N`: the enumerator is meant
//! for small-to-moderate systems (single digits to low tens of norms) and
//! would need sub-sampled coalitions to go further. Callers are expected to
//! cap `N`; see `EstimatorConfig::max_norms`.
//!
//! Enumeration is lazy: only the current index combination is kept in
//! memory. Subsets come grouped by size, lexicographic within a size.

use std::collections::BTreeSet;

use crate::error::ParameterError;
use crate::norms::NormId;

/// A subset of norms (never containing the target) with its Shapley weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Coalition {
    /// Members, in the order of the input ids.
    pub members: Vec<NormId>,
    /// `k! (N - k - 1)! / N!` for `k = members.len()`.
    pub weight: f64,
}

impl Coalition {
    /// Number of members.
    #[must_use]
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Whether `id` is a member.
    #[must_use]
    pub fn contains(&self, id: &NormId) -> bool {
        self.members.contains(id)
    }
}

/// Binomial coefficient `C(n, k)` as a float.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    let mut acc = 1.0f64;
    for i in 0..k {
        acc = acc * (n - i) as f64 / (i + 1) as f64;
    }
    acc.round()
}

/// Shapley weight of a coalition of size `k` among `n` norms.
///
/// Equals `k! (n - k - 1)! / n!`, computed as `1 / (n * C(n - 1, k))` to
/// avoid factorial overflow.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn shapley_weight(n: usize, k: usize) -> f64 {
    if n == 0 || k >= n {
        return 0.0;
    }
    1.0 / (n as f64 * binomial(n - 1, k))
}

/// Number of coalitions for `n` norms: `2^(n-1)`.
#[must_use]
pub fn coalition_count(n: usize) -> u64 {
    match n {
        0 => 0,
        n => 1u64.checked_shl(u32::try_from(n - 1).unwrap_or(u32::MAX)).unwrap_or(u64::MAX),
    }
}

/// Enumerates the coalitions of `all_ids` that exclude `target`.
///
/// Fails if `target` is not among `all_ids` or if an id is repeated.
pub fn enumerate(all_ids: &[NormId], target: &NormId) -> Result<CoalitionIter, ParameterError> {
    let mut seen = BTreeSet::new();
    for id in all_ids {
        if !seen.insert(id) {
            return Err(ParameterError::DuplicateNorm {
                norm: id.to_string(),
            });
        }
    }
    if !seen.contains(target) {
        return Err(ParameterError::UnknownNorm {
            norm: target.to_string(),
        });
    }

    let others: Vec<NormId> = all_ids.iter().filter(|id| *id != target).cloned().collect();
    Ok(CoalitionIter {
        n: all_ids.len(),
        others,
        size: 0,
        indices: Some(Vec::new()),
    })
}

/// Lazy iterator over coalitions; see [`enumerate`].
#[derive(Debug, Clone)]
pub struct CoalitionIter {
    n: usize,
    others: Vec<NormId>,
    size: usize,
    // Current combination of indices into `others`; `None` once exhausted.
    indices: Option<Vec<usize>>,
}

impl CoalitionIter {
    /// Total number of norms, target included.
    #[must_use]
    pub const fn norm_count(&self) -> usize {
        self.n
    }

    fn advance(&mut self) {
        let m = self.others.len();
        let Some(indices) = self.indices.as_mut() else {
            return;
        };
        let k = indices.len();

        // Next combination of the same size, lexicographic.
        let mut i = k;
        while i > 0 {
            i -= 1;
            if indices[i] < m - k + i {
                indices[i] += 1;
                for j in i + 1..k {
                    indices[j] = indices[j - 1] + 1;
                }
                return;
            }
        }

        // Same size exhausted: move to the next size.
        self.size += 1;
        if self.size > m {
            self.indices = None;
        } else {
            self.indices = Some((0..self.size).collect());
        }
    }
}

impl Iterator for CoalitionIter {
    type Item = Coalition;

    fn next(&mut self) -> Option<Coalition> {
        let indices = self.indices.as_ref()?;
        let members = indices.iter().map(|&i| self.others[i].clone()).collect();
        let coalition = Coalition {
            members,
            weight: shapley_weight(self.n, indices.len()),
        };
        self.advance();
        Some(coalition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NormId> {
        names.iter().map(|n| NormId::from(*n)).collect()
    }

    fn factorial(n: usize) -> f64 {
        (1..=n).map(|i| i as f64).product()
    }

    #[test]
    fn weight_matches_factorial_formula() {
        for n in 1..=10 {
            for k in 0..n {
                let expected = factorial(k) * factorial(n - k - 1) / factorial(n);
                assert!((shapley_weight(n, k) - expected).abs() < 1e-12, "n={n} k={k}");
            }
        }
    }

    #[test]
    fn weights_are_normalized() {
        for n in 1..=16 {
            let total: f64 = (0..n).map(|k| binomial(n - 1, k) * shapley_weight(n, k)).sum();
            assert!((total - 1.0).abs() < 1e-9, "n={n} total={total}");
        }
    }

    #[test]
    fn enumerates_every_subset_once() {
        let all = ids(&["a", "b", "c", "d", "e"]);
        let target = NormId::from("c");
        let coalitions: Vec<Coalition> = enumerate(&all, &target).unwrap().collect();
        assert_eq!(coalitions.len(), 16);
        assert_eq!(coalition_count(5), 16);

        let distinct: BTreeSet<Vec<NormId>> = coalitions.iter().map(|c| c.members.clone()).collect();
        assert_eq!(distinct.len(), 16);
        assert!(coalitions.iter().all(|c| !c.contains(&target)));

        let weight_sum: f64 = coalitions.iter().map(|c| c.weight).sum();
        assert!((weight_sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn coalitions_are_grouped_by_size() {
        let all = ids(&["a", "b", "c"]);
        let sizes: Vec<usize> = enumerate(&all, &NormId::from("a"))
            .unwrap()
            .map(|c| c.size())
            .collect();
        assert_eq!(sizes, vec![0, 1, 1, 2]);

        let members: Vec<Vec<NormId>> = enumerate(&all, &NormId::from("a"))
            .unwrap()
            .map(|c| c.members)
            .collect();
        assert_eq!(members[1], ids(&["b"]));
        assert_eq!(members[2], ids(&["c"]));
        assert_eq!(members[3], ids(&["b", "c"]));
    }

    #[test]
    fn single_norm_has_only_the_empty_coalition() {
        let all = ids(&["solo"]);
        let coalitions: Vec<Coalition> = enumerate(&all, &NormId::from("solo")).unwrap().collect();
        assert_eq!(coalitions.len(), 1);
        assert!(coalitions[0].members.is_empty());
        assert!((coalitions[0].weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = enumerate(&ids(&["a", "b"]), &NormId::from("z")).unwrap_err();
        assert_eq!(err, ParameterError::UnknownNorm { norm: "z".to_string() });
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = enumerate(&ids(&["a", "a"]), &NormId::from("a")).unwrap_err();
        assert!(matches!(err, ParameterError::DuplicateNorm { .. }));
    }

    #[test]
    fn coalition_count_saturates() {
        assert_eq!(coalition_count(0), 0);
        assert_eq!(coalition_count(1), 1);
        assert_eq!(coalition_count(11), 1024);
        assert_eq!(coalition_count(200), u64::MAX);
    }
}
