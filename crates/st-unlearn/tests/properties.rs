// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod common;

use approx::assert_abs_diff_eq;
use common::{toy_model, toy_samples, CLASSES};
use st_nn::module::Module;
use st_tensor::Tensor;
use st_unlearn::registry::ORIGINAL_MODEL;
use st_unlearn::strategy::{blend_targets, ScrubPhase, ScrubSchedule};
use st_unlearn::{
    aggregate_unlearning_score, split_accuracy, CaseRegistry, ForgetSpec, JsonFileStore,
    MemoryStore, UnlearnError, UnlearningDataset,
};
use tempfile::tempdir;

#[test]
fn forget_flags_match_the_resolved_classes() {
    for spec in [
        ForgetSpec::explicit(vec![0, 2]),
        ForgetSpec::random_of_size(1),
        ForgetSpec::all(),
    ] {
        let forget = spec.resolve(CLASSES, 4).unwrap();
        let dataset = UnlearningDataset::wrap_classes(toy_samples(5, 1), &forget).unwrap();
        for sample in dataset.samples() {
            assert_eq!(sample.forget, forget.contains(sample.label));
        }
        assert_eq!(dataset.retain_count() + dataset.forget_count(), dataset.len());
    }
}

#[test]
fn extract_then_inject_is_identity() {
    let mut model = toy_model(3);
    let before = model.state_dict().unwrap();
    for indices in [vec![1], vec![2, 3], vec![1, 2, 3]] {
        let extracted = model.extract(&indices).unwrap();
        model
            .inject(&extracted.distinct, &extracted.shared, &indices)
            .unwrap();
        assert_eq!(model.state_dict().unwrap(), before);
    }
}

#[test]
fn split_accuracy_scores_perfect_and_empty_partitions() {
    let labels = [0usize, 1, 2, 1];
    let perfect = split_accuracy(&labels, &labels, &[1]).unwrap();
    assert_abs_diff_eq!(perfect.accuracy, 100.0);
    assert_abs_diff_eq!(perfect.accuracy_forgetting, 100.0);
    assert_abs_diff_eq!(perfect.accuracy_retaining, 100.0);

    let no_forget = split_accuracy(&[0, 2], &[0, 2], &[1]).unwrap();
    assert_abs_diff_eq!(no_forget.accuracy_forgetting, 0.0);
    assert_abs_diff_eq!(no_forget.accuracy_retaining, 100.0);
}

#[test]
fn scrub_schedule_maximises_first_then_minimises() {
    let schedule = ScrubSchedule::new(50, 120);
    for step in 0..50 {
        assert_eq!(schedule.phase(step), Some(ScrubPhase::Maximize));
    }
    for step in 50..120 {
        assert_eq!(schedule.phase(step), Some(ScrubPhase::Minimize));
    }
    assert_eq!(schedule.phase(120), None);
    assert_eq!(schedule.phases().count(), 120);
}

#[test]
fn adding_a_case_twice_keeps_one_entry() {
    let dir = tempdir().unwrap();
    let registry = CaseRegistry::new(JsonFileStore::new(dir.path().join("metrics.json")));
    registry.ensure_dataset("cifar10").unwrap();
    assert!(registry
        .add_case("cifar10", "scrub", "[0, 3]", 80.0, Some(5.0))
        .unwrap());
    assert!(!registry
        .add_case("cifar10", "scrub", "[0, 3]", 81.0, Some(6.0))
        .unwrap());

    let document = registry.document().unwrap();
    let methods = &document.datasets["cifar10"].unlearning_methods;
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].cases.len(), 1);
    assert_abs_diff_eq!(methods[0].cases[0].accuracy_retain, 80.0);
}

#[test]
fn aus_matches_the_documented_example() {
    let registry = CaseRegistry::new(MemoryStore::default());
    registry.ensure_dataset("cifar10").unwrap();
    registry
        .add_case("cifar10", ORIGINAL_MODEL, "[0, 3]", 90.0, None)
        .unwrap();
    registry
        .add_case("cifar10", "scrub", "[0, 3]", 85.0, Some(10.0))
        .unwrap();
    let score = aggregate_unlearning_score(&registry, "cifar10", "scrub", "[0, 3]").unwrap();
    assert_abs_diff_eq!(score, 95.0 / 110.0, epsilon = 1e-9);
    assert_abs_diff_eq!(score, 0.8636, epsilon = 1e-4);

    assert!(matches!(
        aggregate_unlearning_score(&registry, "cifar10", "badT", "[0, 3]"),
        Err(UnlearnError::CaseNotFound { method, .. }) if method == "badT"
    ));
    assert!(matches!(
        aggregate_unlearning_score(&registry, "mnist", "scrub", "[0, 3]"),
        Err(UnlearnError::DatasetNotFound(_))
    ));
}

#[test]
fn fully_flagged_blend_is_the_random_teacher_output() {
    let full = toy_model(1);
    let random = toy_model(2);
    full.set_training(false);
    random.set_training(false);
    let inputs = Tensor::random_normal(5, 16, 0.0, 1.0, Some(8)).unwrap();
    let full_probs = full.forward(&inputs).unwrap().row_softmax().unwrap();
    let random_probs = random.forward(&inputs).unwrap().row_softmax().unwrap();
    let blended = blend_targets(&full_probs, &random_probs, &[true; 5]).unwrap();
    assert_eq!(blended, random_probs);
    let untouched = blend_targets(&full_probs, &random_probs, &[false; 5]).unwrap();
    assert_eq!(untouched, full_probs);
}
