// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Resolution of the configured forgetting policy into concrete class ids or
//! sample indices.

use crate::error::{UnlearnError, UnlearnResult};
use rand::seq::index;
use serde::{Deserialize, Serialize};
use spiral_config::determinism::{derive_seed, rng_from_optional};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgetPolicy {
    /// Use `classes` verbatim.
    #[default]
    Explicit,
    /// Draw `size` distinct classes with the run seed.
    RandomOfSize,
    /// Forget every class.
    All,
}

/// Whether flags are assigned by class label or by sample index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgetMode {
    #[default]
    Classes,
    Indices,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgetSpec {
    pub policy: ForgetPolicy,
    pub classes: Vec<usize>,
    pub size: usize,
    pub mode: ForgetMode,
}

impl ForgetSpec {
    pub fn explicit(classes: impl Into<Vec<usize>>) -> Self {
        Self {
            policy: ForgetPolicy::Explicit,
            classes: classes.into(),
            ..Self::default()
        }
    }

    pub fn random_of_size(size: usize) -> Self {
        Self {
            policy: ForgetPolicy::RandomOfSize,
            size,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            policy: ForgetPolicy::All,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: ForgetMode) -> Self {
        self.mode = mode;
        self
    }

    /// Resolves the class-level forget set for a dataset with `num_classes`
    /// classes.
    pub fn resolve(&self, num_classes: usize, seed: u64) -> UnlearnResult<ResolvedForget> {
        resolve(self.policy, &self.classes, num_classes, self.size, seed)
    }
}

/// Forget and retain class ids. The retain list is always ascending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedForget {
    forget: Vec<usize>,
    retain: Vec<usize>,
    num_classes: usize,
}

impl ResolvedForget {
    fn from_forget(forget: Vec<usize>, num_classes: usize) -> Self {
        let lookup: BTreeSet<usize> = forget.iter().copied().collect();
        let retain = (0..num_classes).filter(|c| !lookup.contains(c)).collect();
        Self {
            forget,
            retain,
            num_classes,
        }
    }

    pub fn forget(&self) -> &[usize] {
        &self.forget
    }

    pub fn retain(&self) -> &[usize] {
        &self.retain
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn contains(&self, class: usize) -> bool {
        self.forget.contains(&class)
    }

    /// Per-class flags, indexed by class id.
    pub fn flags(&self) -> Vec<bool> {
        (0..self.num_classes).map(|c| self.contains(c)).collect()
    }

    /// Literal registry key for this forget set.
    pub fn key(&self) -> String {
        forgetting_set_key(&self.forget)
    }
}

/// Resolves a policy into `(forget, retain)` class ids.
///
/// Explicit lists keep their order; sampled lists are sorted so the registry
/// key is stable across runs with the same seed.
pub fn resolve(
    policy: ForgetPolicy,
    classes: &[usize],
    num_classes: usize,
    size: usize,
    seed: u64,
) -> UnlearnResult<ResolvedForget> {
    if num_classes == 0 {
        return Err(UnlearnError::InvalidForgetSpec(
            "dataset has no classes".to_string(),
        ));
    }
    let forget = match policy {
        ForgetPolicy::Explicit => {
            let mut seen = BTreeSet::new();
            for &class in classes {
                if class >= num_classes {
                    return Err(UnlearnError::InvalidForgetSpec(format!(
                        "class {class} outside [0, {num_classes})"
                    )));
                }
                if !seen.insert(class) {
                    return Err(UnlearnError::InvalidForgetSpec(format!(
                        "class {class} listed twice"
                    )));
                }
            }
            classes.to_vec()
        }
        ForgetPolicy::RandomOfSize => {
            if size > num_classes {
                return Err(UnlearnError::InvalidForgetSpec(format!(
                    "cannot draw {size} classes out of {num_classes}"
                )));
            }
            let mut rng = rng_from_optional(Some(derive_seed(seed, "forget-classes")), "forget-classes");
            let mut drawn = index::sample(&mut rng, num_classes, size).into_vec();
            drawn.sort_unstable();
            drawn
        }
        ForgetPolicy::All => (0..num_classes).collect(),
    };
    Ok(ResolvedForget::from_forget(forget, num_classes))
}

/// Samples `size` distinct dataset indices for index-level forgetting.
pub fn resolve_indices(dataset_len: usize, size: usize, seed: u64) -> UnlearnResult<Vec<usize>> {
    if size > dataset_len {
        return Err(UnlearnError::InvalidForgetSpec(format!(
            "cannot draw {size} samples out of {dataset_len}"
        )));
    }
    let mut rng = rng_from_optional(Some(derive_seed(seed, "forget-indices")), "forget-indices");
    let mut drawn = index::sample(&mut rng, dataset_len, size).into_vec();
    drawn.sort_unstable();
    Ok(drawn)
}

/// Renders ids the way the registry stores them, e.g. `[0, 3]`.
pub fn forgetting_set_key(ids: &[usize]) -> String {
    let body: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    format!("[{}]", body.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_lists_keep_their_order() {
        let resolved = ForgetSpec::explicit(vec![7, 2]).resolve(10, 0).unwrap();
        assert_eq!(resolved.forget(), &[7, 2]);
        assert_eq!(resolved.retain(), &[0, 1, 3, 4, 5, 6, 8, 9]);
        assert_eq!(resolved.key(), "[7, 2]");
    }

    #[test]
    fn explicit_lists_are_validated() {
        assert!(matches!(
            ForgetSpec::explicit(vec![10]).resolve(10, 0),
            Err(UnlearnError::InvalidForgetSpec(_))
        ));
        assert!(ForgetSpec::explicit(vec![1, 1]).resolve(10, 0).is_err());
    }

    #[test]
    fn random_draws_are_reproducible_and_distinct() {
        let spec = ForgetSpec::random_of_size(4);
        let first = spec.resolve(10, 42).unwrap();
        let second = spec.resolve(10, 42).unwrap();
        assert_eq!(first, second);
        let unique: BTreeSet<_> = first.forget().iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(first.forget().windows(2).all(|w| w[0] < w[1]));
        assert_eq!(first.retain().len(), 6);
        assert!(ForgetSpec::random_of_size(11).resolve(10, 1).is_err());
    }

    #[test]
    fn all_forgets_every_class() {
        let resolved = ForgetSpec::all().resolve(3, 0).unwrap();
        assert_eq!(resolved.forget(), &[0, 1, 2]);
        assert!(resolved.retain().is_empty());
        assert_eq!(resolved.flags(), vec![true, true, true]);
    }

    #[test]
    fn index_level_sampling_is_sorted_and_bounded() {
        let drawn = resolve_indices(50, 5, 9).unwrap();
        assert_eq!(drawn.len(), 5);
        assert!(drawn.iter().all(|&i| i < 50));
        assert!(drawn.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(drawn, resolve_indices(50, 5, 9).unwrap());
        assert!(resolve_indices(3, 4, 0).is_err());
    }

    #[test]
    fn keys_render_like_lists() {
        assert_eq!(forgetting_set_key(&[]), "[]");
        assert_eq!(forgetting_set_key(&[0, 3]), "[0, 3]");
    }
}
