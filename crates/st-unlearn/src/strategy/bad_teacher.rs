// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Distillation from a competent and an incompetent teacher. Retain samples
//! follow the original model, forget samples follow a randomly initialised
//! copy.

use super::{run_epochs, sealed, ForwardOutput, StrategyKind, UnlearnReport, UnlearningStrategy};
use crate::config::RunConfig;
use crate::error::UnlearnResult;
use crate::partition::UnlearningLoaders;
use spiral_config::determinism::derive_seed;
use st_nn::loss::{scalar, Loss};
use st_nn::module::Module;
use st_nn::optim::{LrScheduler, Optimizer};
use st_nn::{DistillationKl, PureResult, ReduceLrOnPlateau, Sgd, Tensor, TensorError};
use st_vision::ResNetClassifier;
use tracing::debug;

/// Row `i` of the result is row `i` of `unlearn` when `forget_flags[i]` is
/// set and row `i` of `full` otherwise. Rows are copied, never mixed.
pub fn blend_targets(full: &Tensor, unlearn: &Tensor, forget_flags: &[bool]) -> PureResult<Tensor> {
    if full.shape() != unlearn.shape() {
        return Err(TensorError::ShapeMismatch {
            left: full.shape(),
            right: unlearn.shape(),
        });
    }
    let (rows, cols) = full.shape();
    if forget_flags.len() != rows {
        return Err(TensorError::DataLength {
            expected: rows,
            got: forget_flags.len(),
        });
    }
    let mut data = Vec::with_capacity(rows * cols);
    for (row, &flag) in forget_flags.iter().enumerate() {
        let source = if flag { unlearn } else { full };
        data.extend_from_slice(source.row(row)?);
    }
    Tensor::from_vec(rows, cols, data)
}

pub struct BadTeacher {
    student: ResNetClassifier,
    full_teacher: ResNetClassifier,
    unlearn_teacher: ResNetClassifier,
    optimizer: Sgd,
    scheduler: ReduceLrOnPlateau,
    criterion: DistillationKl,
    temperature: f32,
    epochs: usize,
}

impl BadTeacher {
    pub fn new(model: ResNetClassifier, config: &RunConfig) -> UnlearnResult<Self> {
        let settings = &config.bad_teacher;
        let full_teacher = model.snapshot()?;
        full_teacher.set_training(false);
        let mut unlearn_teacher = model.snapshot()?;
        unlearn_teacher.reinitialize_xavier(derive_seed(config.seed(), "bad-teacher"))?;
        unlearn_teacher.set_training(false);
        Ok(Self {
            student: model,
            full_teacher,
            unlearn_teacher,
            optimizer: Sgd::new(config.train.lr, settings.momentum, settings.weight_decay)?,
            scheduler: ReduceLrOnPlateau::new(settings.plateau_patience, settings.plateau_factor)?,
            criterion: DistillationKl::new(settings.kl_temperature, 1.0)?,
            temperature: settings.kl_temperature,
            epochs: config.train.epochs,
        })
    }

    /// Blended teacher distribution for one batch.
    pub fn teacher_targets(&self, inputs: &Tensor, forget_flags: &[bool]) -> PureResult<Tensor> {
        let full = self
            .full_teacher
            .forward(inputs)?
            .row_softmax_with_temperature(self.temperature)?;
        let unlearn = self
            .unlearn_teacher
            .forward(inputs)?
            .row_softmax_with_temperature(self.temperature)?;
        blend_targets(&full, &unlearn, forget_flags)
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }
}

impl sealed::Sealed for BadTeacher {}

impl UnlearningStrategy for BadTeacher {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BadTeacher
    }

    fn model(&self) -> &ResNetClassifier {
        &self.student
    }

    fn training_parts(&mut self) -> Option<(&mut ResNetClassifier, &mut dyn Optimizer)> {
        Some((&mut self.student, &mut self.optimizer))
    }

    fn forward_pass(
        &mut self,
        inputs: &Tensor,
        _labels: &[usize],
        forget_flags: &[bool],
    ) -> UnlearnResult<ForwardOutput> {
        let target = self.teacher_targets(inputs, forget_flags)?;
        let logits = self.student.forward(inputs)?;
        let loss = scalar(&self.criterion.forward(&logits, &target)?);
        let grad = self.criterion.backward(&logits, &target)?;
        Ok(ForwardOutput { logits, loss, grad })
    }

    fn after_epoch(&mut self, summary: &super::EpochSummary) -> UnlearnResult<()> {
        let lr = self.scheduler.step(summary.last_loss, &mut self.optimizer)?;
        debug!(lr, "bad teacher scheduler step");
        Ok(())
    }

    fn unlearn(&mut self, loaders: &UnlearningLoaders) -> UnlearnResult<UnlearnReport> {
        let epochs = self.epochs;
        run_epochs(self, &loaders.full, epochs, loaders.validation.as_ref())
    }

    fn into_model(self: Box<Self>) -> ResNetClassifier {
        self.student
    }
}
