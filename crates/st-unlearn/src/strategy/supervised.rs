// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{run_epochs, sealed, ForwardOutput, StrategyKind, UnlearnReport, UnlearningStrategy};
use crate::config::RunConfig;
use crate::error::UnlearnResult;
use crate::partition::UnlearningLoaders;
use spiral_config::determinism::derive_seed;
use st_nn::module::Module;
use st_nn::optim::Optimizer;
use st_nn::{AdamW, CrossEntropy, Tensor};
use st_vision::ResNetClassifier;
use tracing::info;

/// Cross-entropy on the retain partition. Retrain starts from freshly
/// initialised weights, Finetune from the supplied model.
pub struct Supervised {
    kind: StrategyKind,
    model: ResNetClassifier,
    optimizer: AdamW,
    criterion: CrossEntropy,
    epochs: usize,
}

impl Supervised {
    /// Same architecture as `template`, new weights drawn from the run seed.
    pub fn retrain(template: &ResNetClassifier, config: &RunConfig) -> UnlearnResult<Self> {
        let seed = derive_seed(config.seed(), "retrain");
        let model = ResNetClassifier::new(template.config().clone(), seed)?;
        info!(seed, "retraining from scratch on the retain set");
        Self::with_model(StrategyKind::Retrain, model, config)
    }

    pub fn finetune(model: ResNetClassifier, config: &RunConfig) -> UnlearnResult<Self> {
        Self::with_model(StrategyKind::Finetune, model, config)
    }

    fn with_model(
        kind: StrategyKind,
        model: ResNetClassifier,
        config: &RunConfig,
    ) -> UnlearnResult<Self> {
        Ok(Self {
            kind,
            model,
            optimizer: AdamW::new(config.train.lr)?,
            criterion: CrossEntropy::new(),
            epochs: config.train.epochs,
        })
    }
}

impl sealed::Sealed for Supervised {}

impl UnlearningStrategy for Supervised {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn model(&self) -> &ResNetClassifier {
        &self.model
    }

    fn training_parts(&mut self) -> Option<(&mut ResNetClassifier, &mut dyn Optimizer)> {
        Some((&mut self.model, &mut self.optimizer))
    }

    fn forward_pass(
        &mut self,
        inputs: &Tensor,
        labels: &[usize],
        _forget_flags: &[bool],
    ) -> UnlearnResult<ForwardOutput> {
        let logits = self.model.forward(inputs)?;
        let (loss, grad) = self.criterion.with_labels(&logits, labels)?;
        Ok(ForwardOutput { logits, loss, grad })
    }

    fn unlearn(&mut self, loaders: &UnlearningLoaders) -> UnlearnResult<UnlearnReport> {
        let epochs = self.epochs;
        run_epochs(self, &loaders.retain, epochs, loaders.validation.as_ref())
    }

    fn into_model(self: Box<Self>) -> ResNetClassifier {
        self.model
    }
}
