// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod common;

use common::{finite, run_config, toy_model, toy_samples};
use st_nn::module::Module;
use st_unlearn::config::MinimizeOn;
use st_unlearn::registry::ORIGINAL_MODEL;
use st_unlearn::strategy::{build_strategy, StrategyContext, StrategyKind};
use st_unlearn::{
    run_unlearning, CaseRegistry, ForgetMode, ForgetSpec, JsonFileStore, LoaderOptions,
    MemoryStore, UnlearningDataset,
};
use std::collections::BTreeSet;
use tempfile::tempdir;

fn loaders_for(config: &st_unlearn::RunConfig) -> (st_unlearn::ResolvedForget, st_unlearn::UnlearningLoaders) {
    let forget = config.forget.resolve(common::CLASSES, config.seed()).unwrap();
    let train = UnlearningDataset::wrap_classes(toy_samples(4, 1), &forget).unwrap();
    let test = UnlearningDataset::wrap_classes(toy_samples(2, 2), &forget).unwrap();
    let loaders = train
        .loaders(LoaderOptions {
            batch_size: config.train.batch_size,
            prefetch: 0,
            seed: config.seed(),
        })
        .with_validation(test.evaluation_loader(4));
    (forget, loaders)
}

#[test]
fn every_strategy_runs_and_keeps_weights_finite() {
    for kind in StrategyKind::ALL {
        let config = run_config(kind.name());
        let (forget, loaders) = loaders_for(&config);
        let context = StrategyContext::new(&config, &forget).unwrap();
        let mut strategy = build_strategy(kind, toy_model(7), &context).unwrap();
        assert_eq!(strategy.kind(), kind);

        let report = strategy.unlearn(&loaders).unwrap();
        assert_eq!(report.kind, kind);
        let expected_epochs = match kind {
            StrategyKind::Scrub => config.scrub.train_iters,
            StrategyKind::Icus => 1,
            _ => config.train.epochs,
        };
        assert_eq!(report.epochs.len(), expected_epochs, "{kind}");
        assert_eq!(report.validations.len(), expected_epochs, "{kind}");
        assert!(report.epochs.iter().all(|epoch| epoch.batches > 0), "{kind}");

        let model = strategy.into_model();
        assert!(finite(&model), "{kind} produced non-finite weights");
    }
}

#[test]
fn training_strategies_change_the_student() {
    for kind in [
        StrategyKind::Finetune,
        StrategyKind::NegGrad,
        StrategyKind::NegGradPlus,
        StrategyKind::BadTeacher,
        StrategyKind::Scrub,
    ] {
        let config = run_config(kind.name());
        let (forget, loaders) = loaders_for(&config);
        let original = toy_model(7);
        let before = original.head().weight().value().clone();
        let context = StrategyContext::new(&config, &forget).unwrap();
        let mut strategy = build_strategy(kind, original, &context).unwrap();
        strategy.unlearn(&loaders).unwrap();
        assert_ne!(strategy.model().head().weight().value(), &before, "{kind}");
    }
}

#[test]
fn retrain_starts_from_fresh_weights() {
    let config = run_config("retrain");
    let (forget, _) = loaders_for(&config);
    let original = toy_model(7);
    let before = original.state_dict().unwrap();
    let context = StrategyContext::new(&config, &forget).unwrap();
    let strategy = build_strategy(StrategyKind::Retrain, original, &context).unwrap();
    assert_ne!(strategy.model().state_dict().unwrap(), before);
    assert_eq!(strategy.model().config(), toy_model(0).config());
}

#[test]
fn icus_only_rewrites_the_selected_groups() {
    let config = run_config("icus");
    let (forget, loaders) = loaders_for(&config);
    let original = toy_model(7);
    let stem_before = original.stage(0).unwrap().conv2().weight().value().clone();
    let head_before = original.head().bias().value().clone();
    let context = StrategyContext::new(&config, &forget).unwrap();
    let mut strategy = build_strategy(StrategyKind::Icus, original, &context).unwrap();
    strategy.unlearn(&loaders).unwrap();
    let model = strategy.into_model();
    assert_eq!(model.stage(0).unwrap().conv2().weight().value(), &stem_before);
    assert_ne!(model.head().bias().value(), &head_before);
}

#[test]
fn validation_leaves_running_statistics_alone() {
    let config = run_config("scrub");
    let (forget, loaders) = loaders_for(&config);
    let context = StrategyContext::new(&config, &forget).unwrap();
    let mut strategy = build_strategy(StrategyKind::Scrub, toy_model(7), &context).unwrap();
    let before = strategy.model().state_dict().unwrap();
    let validation = loaders.validation.as_ref().unwrap();
    let metrics = strategy.validate(validation).unwrap();
    assert_eq!(metrics.samples, validation.len());
    assert_eq!(strategy.model().state_dict().unwrap(), before);
}

#[test]
fn run_records_both_cases_and_scores_them() {
    let dir = tempdir().unwrap();
    let mut config = run_config("neggrad+");
    config.paths.checkpoint_dir = dir.path().join("checkpoints");
    config.paths.save_checkpoints = true;
    let registry = CaseRegistry::new(JsonFileStore::new(dir.path().join("metrics.json")));

    let outcome = run_unlearning(
        &config,
        toy_model(7),
        toy_samples(4, 1),
        toy_samples(2, 2),
        &registry,
        None,
    )
    .unwrap();
    assert_eq!(outcome.kind, StrategyKind::NegGradPlus);
    assert_eq!(outcome.forgetting_set, "[1]");

    let baseline = registry
        .get_case("toy", ORIGINAL_MODEL, "[1]")
        .unwrap()
        .unwrap();
    assert_eq!(baseline.accuracy_retain, outcome.original.accuracy_retaining);
    let unlearned = registry
        .get_case("toy", "neggradplus", "[1]")
        .unwrap()
        .unwrap();
    assert_eq!(unlearned.accuracy_forget, Some(outcome.unlearned.accuracy_forgetting));
    assert_eq!(Some(outcome.aus), st_unlearn::aus(&baseline, &unlearned));

    let checkpoint = outcome.checkpoint.unwrap();
    assert!(checkpoint.ends_with("toy_forgetting_size_1_neggradplus_resnetcustom.bin"));
    assert!(checkpoint.exists());

    // A second run updates the existing cases instead of duplicating them.
    run_unlearning(
        &config,
        toy_model(8),
        toy_samples(4, 1),
        toy_samples(2, 2),
        &registry,
        None,
    )
    .unwrap();
    let document = registry.document().unwrap();
    assert_eq!(document.datasets["toy"].original_model.len(), 1);
    assert_eq!(document.datasets["toy"].unlearning_methods[0].cases.len(), 1);
}

#[test]
fn index_level_runs_key_cases_by_sample_index() {
    let mut config = run_config("finetune");
    config.forget = ForgetSpec::random_of_size(3).with_mode(ForgetMode::Indices);
    let registry = CaseRegistry::new(MemoryStore::default());
    let outcome = run_unlearning(
        &config,
        toy_model(7),
        toy_samples(4, 1),
        toy_samples(2, 2),
        &registry,
        None,
    )
    .unwrap();
    assert!(outcome.forget.forget().is_empty());
    assert_eq!(outcome.forgetting_set.matches(',').count(), 2);
    assert!(registry
        .get_case("toy", "finetuning", &outcome.forgetting_set)
        .unwrap()
        .is_some());
}

#[test]
fn scrub_minimise_steps_train_on_the_configured_split() {
    for (minimize_on, expected) in [(MinimizeOn::Full, 12), (MinimizeOn::Retain, 8)] {
        let mut config = run_config("scrub");
        config.scrub.msteps = 1;
        config.scrub.train_iters = 2;
        config.scrub.minimize_on = minimize_on;
        let (forget, loaders) = loaders_for(&config);
        let context = StrategyContext::new(&config, &forget).unwrap();
        let mut strategy = build_strategy(StrategyKind::Scrub, toy_model(7), &context).unwrap();
        let report = strategy.unlearn(&loaders).unwrap();

        assert_eq!(report.epochs[0].samples, loaders.forget.len());
        assert_eq!(report.epochs[0].samples, 4);
        assert_eq!(report.epochs[1].samples, expected, "{minimize_on:?}");
    }
}

#[test]
fn index_level_checkpoints_are_keyed_by_the_forgotten_samples() {
    let dir = tempdir().unwrap();
    let registry = CaseRegistry::new(MemoryStore::default());
    let mut keys = BTreeSet::new();
    let mut paths = BTreeSet::new();
    for seed in 11..15 {
        let mut config = run_config("neggrad");
        config.seed = Some(seed);
        config.forget = ForgetSpec::random_of_size(3).with_mode(ForgetMode::Indices);
        config.paths.checkpoint_dir = dir.path().to_path_buf();
        config.paths.save_checkpoints = true;
        let outcome = run_unlearning(
            &config,
            toy_model(7),
            toy_samples(4, 1),
            toy_samples(2, 2),
            &registry,
            None,
        )
        .unwrap();

        let checkpoint = outcome.checkpoint.unwrap();
        let file = format!(
            "toy_forgetting_indices_{}_neggrad_resnetcustom.bin",
            outcome.forgetting_set
        );
        assert!(checkpoint.ends_with(&file), "{}", checkpoint.display());
        assert!(checkpoint.exists());
        keys.insert(outcome.forgetting_set);
        paths.insert(checkpoint);
    }
    // Four seeded draws of 3 out of 12 samples.
    assert!(keys.len() > 1);
    assert_eq!(paths.len(), keys.len());
}

#[test]
fn unknown_methods_are_rejected_before_any_work() {
    let config = run_config("ssd");
    let registry = CaseRegistry::new(MemoryStore::default());
    let result = run_unlearning(
        &config,
        toy_model(7),
        toy_samples(1, 1),
        toy_samples(1, 2),
        &registry,
        None,
    );
    assert!(matches!(result, Err(st_unlearn::UnlearnError::UnknownStrategy(_))));
    assert!(registry.document().unwrap().datasets.is_empty());
}
