// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Retain/forget accuracy and the aggregate unlearning score.

use crate::error::{UnlearnError, UnlearnResult};
use crate::partition::UnlearningSample;
use crate::registry::{CaseRecord, CaseRegistry, RegistryStore, ORIGINAL_MODEL};
use serde::{Deserialize, Serialize};
use st_nn::dataset::DataLoader;
use st_nn::module::Module;
use st_tensor::TensorError;
use std::collections::BTreeSet;
use tracing::debug;

/// Accuracies in percent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitAccuracy {
    pub accuracy: f64,
    pub accuracy_forgetting: f64,
    pub accuracy_retaining: f64,
}

/// Runs one inference pass with normalisation layers in evaluation mode and
/// returns `(y_true, y_pred)` in loader order. The model is left in
/// evaluation mode.
pub fn classify<M: Module + ?Sized>(
    model: &M,
    loader: &DataLoader<UnlearningSample>,
) -> UnlearnResult<(Vec<usize>, Vec<usize>)> {
    model.set_training(false);
    let mut y_true = Vec::with_capacity(loader.len());
    let mut y_pred = Vec::with_capacity(loader.len());
    for batch in loader.iter() {
        let batch = batch?;
        let logits = model.forward(&batch.inputs)?;
        y_pred.extend(logits.argmax_rows());
        y_true.extend_from_slice(&batch.labels);
    }
    debug!(samples = y_true.len(), "classification pass finished");
    Ok((y_true, y_pred))
}

fn percent(correct: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * correct as f64 / total as f64
    }
}

/// Partitions predictions by whether the true label is a forget class. An
/// empty partition scores `0`.
pub fn split_accuracy(
    y_true: &[usize],
    y_pred: &[usize],
    forget_classes: &[usize],
) -> UnlearnResult<SplitAccuracy> {
    if y_true.len() != y_pred.len() {
        return Err(TensorError::DataLength {
            expected: y_true.len(),
            got: y_pred.len(),
        }
        .into());
    }
    let forget: BTreeSet<usize> = forget_classes.iter().copied().collect();
    let (mut correct, mut correct_forget, mut total_forget, mut correct_retain) = (0, 0, 0, 0);
    for (truth, pred) in y_true.iter().zip(y_pred) {
        let hit = truth == pred;
        correct += usize::from(hit);
        if forget.contains(truth) {
            total_forget += 1;
            correct_forget += usize::from(hit);
        } else {
            correct_retain += usize::from(hit);
        }
    }
    Ok(SplitAccuracy {
        accuracy: percent(correct, y_true.len()),
        accuracy_forgetting: percent(correct_forget, total_forget),
        accuracy_retaining: percent(correct_retain, y_true.len() - total_forget),
    })
}

/// Classifies `loader` and splits the result by `forget_classes`.
pub fn evaluate<M: Module + ?Sized>(
    model: &M,
    loader: &DataLoader<UnlearningSample>,
    forget_classes: &[usize],
) -> UnlearnResult<SplitAccuracy> {
    let (y_true, y_pred) = classify(model, loader)?;
    split_accuracy(&y_true, &y_pred, forget_classes)
}

/// Splits accuracy by each sample's own forget flag instead of its class.
/// Used for index-level forgetting.
pub fn evaluate_flagged<M: Module + ?Sized>(
    model: &M,
    loader: &DataLoader<UnlearningSample>,
) -> UnlearnResult<SplitAccuracy> {
    model.set_training(false);
    let (mut hits, mut forget_hits, mut forget_total, mut total) = (0, 0, 0, 0);
    for batch in loader.iter() {
        let batch = batch?;
        let predicted = model.forward(&batch.inputs)?.argmax_rows();
        for ((pred, label), flag) in predicted.iter().zip(&batch.labels).zip(&batch.forget_flags) {
            let hit = usize::from(pred == label);
            hits += hit;
            total += 1;
            if *flag {
                forget_total += 1;
                forget_hits += hit;
            }
        }
    }
    Ok(SplitAccuracy {
        accuracy: percent(hits, total),
        accuracy_forgetting: percent(forget_hits, forget_total),
        accuracy_retaining: percent(hits - forget_hits, total - forget_total),
    })
}

/// `(1 - Δretain) / (1 + |forget|)` with accuracies read as fractions of 100.
/// The unlearned case must carry a forget accuracy.
pub fn aus(original: &CaseRecord, unlearned: &CaseRecord) -> Option<f64> {
    let forget = unlearned.accuracy_forget?;
    let retain_drop = (original.accuracy_retain - unlearned.accuracy_retain) / 100.0;
    Some((1.0 - retain_drop) / (1.0 + (forget / 100.0).abs()))
}

/// AUS for `method` on `forgetting_set`, read back from the registry.
pub fn aggregate_unlearning_score<S: RegistryStore>(
    registry: &CaseRegistry<S>,
    dataset: &str,
    method: &str,
    forgetting_set: &str,
) -> UnlearnResult<f64> {
    let document = registry.document()?;
    if !document.datasets.contains_key(dataset) {
        return Err(UnlearnError::DatasetNotFound(dataset.to_string()));
    }
    let lookup = |name: &str| {
        document
            .case(dataset, name, forgetting_set)
            .ok_or_else(|| UnlearnError::CaseNotFound {
                dataset: dataset.to_string(),
                method: name.to_string(),
                forgetting_set: forgetting_set.to_string(),
            })
    };
    let original = lookup(ORIGINAL_MODEL)?;
    let unlearned = lookup(method)?;
    aus(&original, &unlearned).ok_or_else(|| UnlearnError::MissingForgetAccuracy {
        method: method.to_string(),
        forgetting_set: forgetting_set.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn split_accuracy_counts_each_partition() {
        let scores = split_accuracy(&[0, 0, 1, 2], &[0, 1, 1, 0], &[1]).unwrap();
        assert_abs_diff_eq!(scores.accuracy, 50.0);
        assert_abs_diff_eq!(scores.accuracy_forgetting, 100.0);
        assert_abs_diff_eq!(scores.accuracy_retaining, 100.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(split_accuracy(&[0, 1], &[0], &[]).is_err());
    }

    #[test]
    fn empty_input_scores_zero() {
        let scores = split_accuracy(&[], &[], &[0]).unwrap();
        assert_eq!(scores, SplitAccuracy::default());
    }

    #[test]
    fn aus_rewards_retention_and_penalises_forget_accuracy() {
        let original = CaseRecord {
            accuracy_retain: 90.0,
            accuracy_forget: None,
        };
        let perfect = CaseRecord {
            accuracy_retain: 90.0,
            accuracy_forget: Some(0.0),
        };
        assert_abs_diff_eq!(aus(&original, &perfect).unwrap(), 1.0);
        let leaky = CaseRecord {
            accuracy_retain: 90.0,
            accuracy_forget: Some(50.0),
        };
        assert!(aus(&original, &leaky).unwrap() < 1.0);
        assert_eq!(aus(&original, &original), None);
    }

    #[test]
    fn registry_cases_without_forget_accuracy_are_rejected() {
        use crate::registry::MemoryStore;

        let registry = CaseRegistry::new(MemoryStore::default());
        registry
            .record_case("toy", ORIGINAL_MODEL, "[1]", 90.0, None)
            .unwrap();
        registry.record_case("toy", "scrub", "[1]", 88.0, None).unwrap();
        let err = aggregate_unlearning_score(&registry, "toy", "scrub", "[1]").unwrap_err();
        assert!(matches!(err, UnlearnError::MissingForgetAccuracy { .. }));

        registry
            .record_case("toy", "neggrad", "[1]", 88.0, Some(0.0))
            .unwrap();
        let score = aggregate_unlearning_score(&registry, "toy", "neggrad", "[1]").unwrap();
        assert_abs_diff_eq!(score, 0.98, epsilon = 1e-9);
    }
}
