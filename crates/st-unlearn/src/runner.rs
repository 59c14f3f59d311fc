// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! End-to-end unlearning run: resolve the forget set, score the original
//! model, unlearn, score again and record both cases.

use crate::checkpoint::{load_model, save_model, CheckpointFormat, CheckpointNaming};
use crate::config::RunConfig;
use crate::error::UnlearnResult;
use crate::evaluation::{aggregate_unlearning_score, evaluate, evaluate_flagged, SplitAccuracy};
use crate::forget::{
    forgetting_set_key, resolve_indices, ForgetMode, ForgetSpec, ResolvedForget,
};
use crate::icus::ClassEmbedder;
use crate::partition::{LabeledSample, LoaderOptions, UnlearningDataset, UnlearningSample};
use crate::registry::{CaseRegistry, RegistryStore, ORIGINAL_MODEL};
use crate::strategy::{build_strategy, StrategyContext, StrategyKind, UnlearnReport};
use spiral_config::determinism::derive_seed;
use st_nn::dataset::DataLoader;
use st_vision::ResNetClassifier;
use std::path::PathBuf;
use tracing::{info, info_span};

#[derive(Debug)]
pub struct RunOutcome {
    pub kind: StrategyKind,
    pub forget: ResolvedForget,
    /// Registry key both cases were stored under.
    pub forgetting_set: String,
    pub original: SplitAccuracy,
    pub unlearned: SplitAccuracy,
    pub report: UnlearnReport,
    pub aus: f64,
    pub model: ResNetClassifier,
    pub checkpoint: Option<PathBuf>,
}

/// Fresh backbone for the configured preset and dataset geometry.
pub fn build_model(config: &RunConfig) -> UnlearnResult<ResNetClassifier> {
    let dataset = &config.dataset;
    Ok(ResNetClassifier::from_preset(
        config.model,
        dataset.input_channels,
        dataset.input_hw,
        dataset.num_classes,
        derive_seed(config.seed(), "model-init"),
    )?)
}

/// Loads `{checkpoint_dir}/{dataset}_{model}.{json|bin}`.
pub fn load_original_model(
    config: &RunConfig,
    format: CheckpointFormat,
) -> UnlearnResult<ResNetClassifier> {
    let mut model = build_model(config)?;
    let naming = CheckpointNaming::new(config.dataset.name.clone(), config.model);
    let path = naming.path(&config.paths.checkpoint_dir, &naming.original(), format);
    load_model(&mut model, &path, format)?;
    Ok(model)
}

/// Accuracy pair stored in the registry: retain accuracy first.
fn score(
    model: &ResNetClassifier,
    test: &DataLoader<UnlearningSample>,
    train_eval: &DataLoader<UnlearningSample>,
    forget: &ResolvedForget,
    mode: ForgetMode,
) -> UnlearnResult<SplitAccuracy> {
    match mode {
        ForgetMode::Classes => evaluate(model, test, forget.forget()),
        ForgetMode::Indices => {
            let flagged = evaluate_flagged(model, train_eval)?;
            let held_out = evaluate(model, test, &[])?;
            Ok(SplitAccuracy {
                accuracy: held_out.accuracy,
                accuracy_forgetting: flagged.accuracy_forgetting,
                accuracy_retaining: held_out.accuracy,
            })
        }
    }
}

pub fn run_unlearning<S: RegistryStore>(
    config: &RunConfig,
    model: ResNetClassifier,
    train: Vec<LabeledSample>,
    test: Vec<LabeledSample>,
    registry: &CaseRegistry<S>,
    embedder: Option<Box<dyn ClassEmbedder>>,
) -> UnlearnResult<RunOutcome> {
    let kind = config.strategy_kind()?;
    let seed = config.seed();
    let span = info_span!("unlearn", method = %kind, dataset = %config.dataset.name);
    let _guard = span.enter();

    let mode = config.forget.mode;
    let forget = match mode {
        ForgetMode::Classes => config.forget.resolve(config.dataset.num_classes, seed)?,
        // Index-level runs keep every class; `forget.size` counts samples.
        ForgetMode::Indices => ForgetSpec::default().resolve(config.dataset.num_classes, seed)?,
    };
    // `forget_indices` is `Some` for index-level runs only.
    let (train_set, test_set, forgetting_set, forget_indices) = match mode {
        ForgetMode::Classes => (
            UnlearningDataset::wrap_classes(train, &forget)?,
            UnlearningDataset::wrap_classes(test, &forget)?,
            forget.key(),
            None,
        ),
        ForgetMode::Indices => {
            let indices = resolve_indices(train.len(), config.forget.size, seed)?;
            let key = forgetting_set_key(&indices);
            (
                UnlearningDataset::wrap_indices(train, &indices)?,
                UnlearningDataset::wrap_indices(test, &[])?,
                key,
                Some(indices),
            )
        }
    };
    info!(forget = ?forget.forget(), key = %forgetting_set, ?mode, "resolved forgetting set");

    let batch_size = config.train.batch_size;
    let test_loader = test_set.evaluation_loader(batch_size);
    let train_eval = train_set.evaluation_loader(batch_size);
    let dataset = config.dataset.name.as_str();

    let original = score(&model, &test_loader, &train_eval, &forget, mode)?;
    registry.record_case(
        dataset,
        ORIGINAL_MODEL,
        &forgetting_set,
        original.accuracy_retaining,
        None,
    )?;
    info!(
        retain = original.accuracy_retaining,
        forget = original.accuracy_forgetting,
        "scored original model"
    );

    let options = LoaderOptions {
        batch_size,
        prefetch: config.train.prefetch,
        seed,
    };
    let loaders = train_set
        .loaders(options)
        .with_validation(test_set.evaluation_loader(batch_size));
    let mut context = StrategyContext::new(config, &forget)?;
    if let Some(embedder) = embedder {
        context = context.with_embedder(embedder);
    }
    let mut strategy = build_strategy(kind, model, &context)?;
    let report = strategy.unlearn(&loaders)?;
    let model = strategy.into_model();

    let unlearned = score(&model, &test_loader, &train_eval, &forget, mode)?;
    registry.record_case(
        dataset,
        kind.name(),
        &forgetting_set,
        unlearned.accuracy_retaining,
        Some(unlearned.accuracy_forgetting),
    )?;
    let aus = aggregate_unlearning_score(registry, dataset, kind.name(), &forgetting_set)?;
    info!(
        retain = unlearned.accuracy_retaining,
        forget = unlearned.accuracy_forgetting,
        aus,
        "scored unlearned model"
    );

    let checkpoint = if config.paths.save_checkpoints {
        let naming = CheckpointNaming::new(dataset, config.model);
        let stem = match (&forget_indices, kind) {
            (Some(indices), _) => naming.unlearned_indices(indices, kind.name()),
            (None, StrategyKind::Retrain) => naming.retrained(forget.forget()),
            (None, StrategyKind::Finetune) => naming.finetuned(forget.forget()),
            (None, _) => naming.unlearned(forget.forget().len(), kind.name()),
        };
        let format = CheckpointFormat::default();
        let path = naming.path(&config.paths.checkpoint_dir, &stem, format);
        save_model(&model, &path, format)?;
        Some(path)
    } else {
        None
    };

    Ok(RunOutcome {
        kind,
        forget,
        forgetting_set,
        original,
        unlearned,
        report,
        aus,
        model,
        checkpoint,
    })
}
