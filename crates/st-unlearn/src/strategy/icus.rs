// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{sealed, ForwardOutput, StrategyKind, UnlearnReport, UnlearningStrategy};
use crate::config::{IcusConfig, RunConfig};
use crate::error::UnlearnResult;
use crate::forget::ResolvedForget;
use crate::icus::{mapper_optimizer, ClassEmbedder, IcusDataset, SurgeryPlan, WeightMapper};
use crate::partition::UnlearningLoaders;
use spiral_config::determinism::derive_seed;
use st_nn::module::Module;
use st_nn::optim::Optimizer;
use st_nn::{CrossEntropy, Tensor};
use st_vision::ResNetClassifier;
use tracing::{info, warn};

/// One-shot weight surgery. The backbone is never trained through the
/// loaders; the only pass over them reports the loss after surgery.
pub struct IcusSurgery {
    model: ResNetClassifier,
    records: IcusDataset,
    mapper: WeightMapper,
    settings: IcusConfig,
    criterion: CrossEntropy,
    plan: Option<SurgeryPlan>,
}

impl IcusSurgery {
    pub fn new(
        model: ResNetClassifier,
        config: &RunConfig,
        forget: &ResolvedForget,
        embedder: &dyn ClassEmbedder,
    ) -> UnlearnResult<Self> {
        let class_names = if config.dataset.class_names.is_empty() {
            warn!("no class names configured, embedding class ids");
            (0..model.num_classes()).map(|c| format!("class {c}")).collect()
        } else {
            config.dataset.class_names.clone()
        };
        let records = IcusDataset::build(
            &model,
            embedder,
            &class_names,
            forget,
            &config.icus.layers,
        )?;
        let mapper = WeightMapper::for_dataset(
            &records,
            config.icus.hidden_dim,
            derive_seed(config.seed(), "icus-mapper"),
        )?;
        Ok(Self {
            model,
            records,
            mapper,
            settings: config.icus.clone(),
            criterion: CrossEntropy::new(),
            plan: None,
        })
    }

    pub fn records(&self) -> &IcusDataset {
        &self.records
    }

    /// The weights written by the last surgery.
    pub fn plan(&self) -> Option<&SurgeryPlan> {
        self.plan.as_ref()
    }

    /// Trains the mapper and injects its prediction into the backbone.
    pub fn apply_surgery(&mut self) -> UnlearnResult<()> {
        let mut optimizer = mapper_optimizer(self.settings.lr)?;
        let plan = self.records.surgery(
            &mut self.mapper,
            &mut optimizer,
            self.settings.epochs,
            self.settings.forget_margin,
        )?;
        self.records
            .schema()
            .inject(&mut self.model, &plan.weights.distinct, &plan.weights.shared)?;
        info!(layers = ?self.records.schema().indices(), "injected surgery weights");
        self.plan = Some(plan);
        Ok(())
    }
}

impl sealed::Sealed for IcusSurgery {}

impl UnlearningStrategy for IcusSurgery {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Icus
    }

    fn model(&self) -> &ResNetClassifier {
        &self.model
    }

    fn training_parts(&mut self) -> Option<(&mut ResNetClassifier, &mut dyn Optimizer)> {
        None
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
        self.apply_surgery()?;
        let mut report = UnlearnReport::new(StrategyKind::Icus);
        report.epochs.push(self.train_one_epoch(&loaders.full)?);
        if let Some(validation) = loaders.validation.as_ref() {
            report.validations.push(self.validate(validation)?);
        }
        Ok(report)
    }

    fn into_model(self: Box<Self>) -> ResNetClassifier {
        self.model
    }
}
