// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Alternating max/min distillation against a frozen copy of the original
//! model.

use super::{sealed, EpochSummary, ForwardOutput, StrategyKind, UnlearnReport, UnlearningStrategy};
use crate::config::{MinimizeOn, RunConfig};
use crate::error::UnlearnResult;
use crate::partition::{UnlearningLoaders, UnlearningSample};
use serde::{Deserialize, Serialize};
use st_nn::loss::{scalar, Loss};
use st_nn::module::Module;
use st_nn::optim::Optimizer;
use st_nn::dataset::DataLoader;
use st_nn::{CrossEntropy, DistillationKl, Sgd, Tensor};
use st_vision::ResNetClassifier;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrubPhase {
    /// Push the student away from the teacher on the forget set.
    Maximize,
    /// Pull the student back towards the teacher on the full or retain set.
    Minimize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubSchedule {
    pub msteps: usize,
    pub total_steps: usize,
}

impl ScrubSchedule {
    pub fn new(msteps: usize, total_steps: usize) -> Self {
        Self { msteps, total_steps }
    }

    /// `None` once the step budget is spent.
    pub fn phase(&self, step: usize) -> Option<ScrubPhase> {
        if step >= self.total_steps {
            None
        } else if step < self.msteps {
            Some(ScrubPhase::Maximize)
        } else {
            Some(ScrubPhase::Minimize)
        }
    }

    pub fn phases(&self) -> impl Iterator<Item = (usize, ScrubPhase)> + '_ {
        (0..self.total_steps).filter_map(|step| self.phase(step).map(|phase| (step, phase)))
    }
}

pub struct Scrub {
    student: ResNetClassifier,
    teacher: ResNetClassifier,
    optimizer: Sgd,
    ce: CrossEntropy,
    kd: DistillationKl,
    alpha: f32,
    schedule: ScrubSchedule,
    minimize_on: MinimizeOn,
    phase: ScrubPhase,
}

impl Scrub {
    pub fn new(model: ResNetClassifier, config: &RunConfig) -> UnlearnResult<Self> {
        let settings = &config.scrub;
        let teacher = model.snapshot()?;
        teacher.set_training(false);
        Ok(Self {
            student: model,
            teacher,
            optimizer: Sgd::new(config.train.lr, settings.momentum, settings.weight_decay)?,
            ce: CrossEntropy::new(),
            kd: DistillationKl::hinton(settings.kd_temperature)?,
            alpha: settings.alpha,
            schedule: ScrubSchedule::new(settings.msteps, settings.train_iters),
            minimize_on: settings.minimize_on,
            phase: ScrubPhase::Minimize,
        })
    }

    pub fn schedule(&self) -> ScrubSchedule {
        self.schedule
    }

    pub fn phase(&self) -> ScrubPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: ScrubPhase) {
        self.phase = phase;
    }

    /// Loader a step of `phase` trains on.
    pub fn loader_for<'a>(
        &self,
        phase: ScrubPhase,
        loaders: &'a UnlearningLoaders,
    ) -> &'a DataLoader<UnlearningSample> {
        match (phase, self.minimize_on) {
            (ScrubPhase::Maximize, _) => &loaders.forget,
            (ScrubPhase::Minimize, MinimizeOn::Full) => &loaders.full,
            (ScrubPhase::Minimize, MinimizeOn::Retain) => &loaders.retain,
        }
    }
}

impl sealed::Sealed for Scrub {}

impl UnlearningStrategy for Scrub {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Scrub
    }

    fn model(&self) -> &ResNetClassifier {
        &self.student
    }

    fn training_parts(&mut self) -> Option<(&mut ResNetClassifier, &mut dyn Optimizer)> {
        Some((&mut self.student, &mut self.optimizer))
    }

    /// `CE + α·KD·T²`, negated while maximising.
    fn forward_pass(
        &mut self,
        inputs: &Tensor,
        labels: &[usize],
        _forget_flags: &[bool],
    ) -> UnlearnResult<ForwardOutput> {
        let soft = self
            .teacher
            .forward(inputs)?
            .row_softmax_with_temperature(self.kd.temperature())?;
        let logits = self.student.forward(inputs)?;
        let (ce_loss, ce_grad) = self.ce.with_labels(&logits, labels)?;
        let kd_loss = scalar(&self.kd.forward(&logits, &soft)?);
        let mut grad = ce_grad;
        grad.add_scaled(&self.kd.backward(&logits, &soft)?, self.alpha)?;
        let mut loss = ce_loss + self.alpha * kd_loss;
        if self.phase == ScrubPhase::Maximize {
            loss = -loss;
            grad = grad.scale(-1.0)?;
        }
        Ok(ForwardOutput { logits, loss, grad })
    }

    fn unlearn(&mut self, loaders: &UnlearningLoaders) -> UnlearnResult<UnlearnReport> {
        let mut report = UnlearnReport::new(StrategyKind::Scrub);
        let schedule = self.schedule;
        for (step, phase) in schedule.phases() {
            self.phase = phase;
            let loader = self.loader_for(phase, loaders);
            let summary: EpochSummary = self.train_one_epoch(loader)?;
            info!(step, ?phase, loss = summary.loss, "scrub step");
            report.epochs.push(summary);
            if let Some(validation) = loaders.validation.as_ref() {
                report.validations.push(self.validate(validation)?);
            }
        }
        Ok(report)
    }

    fn into_model(self: Box<Self>) -> ResNetClassifier {
        self.student
    }
}
