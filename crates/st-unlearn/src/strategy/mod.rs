// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Unlearning strategies.
//!
//! Every strategy owns the student backbone, the optimiser bound to it and any
//! frozen teachers it distils from. The trait is sealed: new strategies are
//! added here and wired through [`build_strategy`].

mod bad_teacher;
mod icus;
mod neggrad;
mod scrub;
mod supervised;

pub use bad_teacher::{blend_targets, BadTeacher};
pub use icus::IcusSurgery;
pub use neggrad::{NegGrad, NegGradPlus};
pub use scrub::{Scrub, ScrubPhase, ScrubSchedule};
pub use supervised::Supervised;

use crate::config::RunConfig;
use crate::error::{UnlearnError, UnlearnResult};
use crate::forget::ResolvedForget;
use crate::icus::{ClassEmbedder, HashedNgramEmbedder};
use crate::partition::{UnlearningLoaders, UnlearningSample};
use serde::{Deserialize, Serialize};
use st_nn::dataset::DataLoader;
use st_nn::module::Module;
use st_nn::optim::Optimizer;
use st_nn::{PureResult, Tensor, TensorError};
use st_vision::ResNetClassifier;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

mod sealed {
    pub trait Sealed {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    Retrain,
    Finetune,
    NegGrad,
    NegGradPlus,
    BadTeacher,
    Scrub,
    Icus,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 7] = [
        StrategyKind::Retrain,
        StrategyKind::Finetune,
        StrategyKind::NegGrad,
        StrategyKind::NegGradPlus,
        StrategyKind::BadTeacher,
        StrategyKind::Scrub,
        StrategyKind::Icus,
    ];

    /// Method name used in the registry and in checkpoint names.
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Retrain => "retrain",
            StrategyKind::Finetune => "finetuning",
            StrategyKind::NegGrad => "neggrad",
            StrategyKind::NegGradPlus => "neggradplus",
            StrategyKind::BadTeacher => "badT",
            StrategyKind::Scrub => "scrub",
            StrategyKind::Icus => "icus",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = UnlearnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retrain" => Ok(StrategyKind::Retrain),
            "finetune" | "finetuning" => Ok(StrategyKind::Finetune),
            "neggrad" => Ok(StrategyKind::NegGrad),
            "neggradplus" | "neggrad+" => Ok(StrategyKind::NegGradPlus),
            "badt" | "bad_teacher" => Ok(StrategyKind::BadTeacher),
            "scrub" => Ok(StrategyKind::Scrub),
            "icus" => Ok(StrategyKind::Icus),
            _ => Err(UnlearnError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Student logits plus the loss value and its gradient with respect to them.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub logits: Tensor,
    pub loss: f32,
    pub grad: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Sample-weighted mean batch loss.
    pub loss: f32,
    pub last_loss: f32,
    pub batches: usize,
    pub samples: usize,
}

/// Validation pass results, accuracies in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub loss: f32,
    pub accuracy: f64,
    pub accuracy_forget: f64,
    pub accuracy_retain: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlearnReport {
    pub kind: StrategyKind,
    pub epochs: Vec<EpochSummary>,
    pub validations: Vec<ValidationMetrics>,
}

impl UnlearnReport {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            epochs: Vec::new(),
            validations: Vec::new(),
        }
    }

    pub fn final_loss(&self) -> Option<f32> {
        self.epochs.last().map(|epoch| epoch.last_loss)
    }
}

pub trait UnlearningStrategy: sealed::Sealed {
    fn kind(&self) -> StrategyKind;

    /// The student being unlearned.
    fn model(&self) -> &ResNetClassifier;

    /// Student and optimiser for gradient updates. `None` for strategies
    /// that never train the backbone through the loaders.
    fn training_parts(&mut self) -> Option<(&mut ResNetClassifier, &mut dyn Optimizer)>;

    /// Computes the strategy loss on one batch without touching gradients.
    fn forward_pass(
        &mut self,
        inputs: &Tensor,
        labels: &[usize],
        forget_flags: &[bool],
    ) -> UnlearnResult<ForwardOutput>;

    /// Hook run after every training epoch.
    fn after_epoch(&mut self, _summary: &EpochSummary) -> UnlearnResult<()> {
        Ok(())
    }

    /// One pass over `loader`: forward, backward and an optimiser step per
    /// batch. Without training parts the pass only reports the loss.
    fn train_one_epoch(
        &mut self,
        loader: &DataLoader<UnlearningSample>,
    ) -> UnlearnResult<EpochSummary> {
        let trains = match self.training_parts() {
            Some((model, _)) => {
                model.set_training(true);
                model.zero_accumulators()?;
                true
            }
            None => {
                self.model().set_training(false);
                false
            }
        };
        let mut summary = EpochSummary {
            loss: 0.0,
            last_loss: f32::NAN,
            batches: 0,
            samples: 0,
        };
        let mut weighted = 0.0f32;
        for batch in loader.iter() {
            let batch = batch?;
            let output = self.forward_pass(&batch.inputs, &batch.labels, &batch.forget_flags)?;
            if trains {
                if let Some((model, optimizer)) = self.training_parts() {
                    model.backward(&batch.inputs, &output.grad)?;
                    optimizer.step(model)?;
                }
            }
            weighted += output.loss * batch.len() as f32;
            summary.samples += batch.len();
            summary.batches += 1;
            summary.last_loss = output.loss;
            debug!(batch = summary.batches, loss = output.loss, "strategy batch");
        }
        if summary.samples == 0 {
            warn!(strategy = %self.kind(), "training loader is empty, nothing to do");
        } else {
            summary.loss = weighted / summary.samples as f32;
        }
        Ok(summary)
    }

    /// Evaluation-mode pass that leaves weights, gradients and running
    /// statistics untouched. The previous training flag is restored.
    fn validate(
        &mut self,
        loader: &DataLoader<UnlearningSample>,
    ) -> UnlearnResult<ValidationMetrics> {
        let previous = self.model().is_training();
        self.model().set_training(false);
        let result = validation_pass(self, loader);
        self.model().set_training(previous);
        result
    }

    /// Runs the full unlearning procedure.
    fn unlearn(&mut self, loaders: &UnlearningLoaders) -> UnlearnResult<UnlearnReport>;

    /// Consumes the strategy and returns the unlearned student.
    fn into_model(self: Box<Self>) -> ResNetClassifier;
}

fn validation_pass<S: UnlearningStrategy + ?Sized>(
    strategy: &mut S,
    loader: &DataLoader<UnlearningSample>,
) -> UnlearnResult<ValidationMetrics> {
    let (mut hits, mut forget_hits, mut forget_total) = (0usize, 0usize, 0usize);
    let mut metrics = ValidationMetrics::default();
    let mut weighted = 0.0f32;
    for batch in loader.iter() {
        let batch = batch?;
        let output = strategy.forward_pass(&batch.inputs, &batch.labels, &batch.forget_flags)?;
        for ((pred, label), flag) in output
            .logits
            .argmax_rows()
            .into_iter()
            .zip(&batch.labels)
            .zip(&batch.forget_flags)
        {
            let hit = usize::from(pred == *label);
            hits += hit;
            if *flag {
                forget_total += 1;
                forget_hits += hit;
            }
        }
        weighted += output.loss * batch.len() as f32;
        metrics.samples += batch.len();
    }
    let percent = |num: usize, den: usize| {
        if den == 0 {
            0.0
        } else {
            100.0 * num as f64 / den as f64
        }
    };
    if metrics.samples > 0 {
        metrics.loss = weighted / metrics.samples as f32;
    }
    metrics.accuracy = percent(hits, metrics.samples);
    metrics.accuracy_forget = percent(forget_hits, forget_total);
    metrics.accuracy_retain = percent(hits - forget_hits, metrics.samples - forget_total);
    Ok(metrics)
}

/// Runs `epochs` training passes over `loader`, validating after each one
/// when a validation loader is present.
pub(crate) fn run_epochs<S: UnlearningStrategy + ?Sized>(
    strategy: &mut S,
    loader: &DataLoader<UnlearningSample>,
    epochs: usize,
    validation: Option<&DataLoader<UnlearningSample>>,
) -> UnlearnResult<UnlearnReport> {
    let mut report = UnlearnReport::new(strategy.kind());
    for epoch in 0..epochs {
        let summary = strategy.train_one_epoch(loader)?;
        strategy.after_epoch(&summary)?;
        info!(
            strategy = %strategy.kind(),
            epoch,
            loss = summary.loss,
            batches = summary.batches,
            "epoch finished"
        );
        report.epochs.push(summary);
        if let Some(validation) = validation {
            let metrics = strategy.validate(validation)?;
            info!(
                epoch,
                accuracy = metrics.accuracy,
                forget = metrics.accuracy_forget,
                retain = metrics.accuracy_retain,
                "validation"
            );
            report.validations.push(metrics);
        }
    }
    Ok(report)
}

/// Cross-entropy with one weight per row: `Σ wᵢ · CEᵢ`. The gradient of row
/// `i` is `wᵢ · (softmax(xᵢ) − onehot(yᵢ))`.
pub(crate) fn weighted_cross_entropy(
    logits: &Tensor,
    labels: &[usize],
    weights: &[f32],
) -> PureResult<(f32, Tensor)> {
    let (rows, cols) = logits.shape();
    if labels.len() != rows || weights.len() != rows {
        return Err(TensorError::DataLength {
            expected: rows,
            got: labels.len().min(weights.len()),
        });
    }
    let log_probs = logits.row_log_softmax_with_temperature(1.0)?;
    let mut grad = logits.row_softmax()?;
    let mut loss = 0.0f32;
    for (row, (&label, &weight)) in labels.iter().zip(weights).enumerate() {
        if label >= cols {
            return Err(TensorError::IndexOutOfBounds {
                index: label,
                len: cols,
            });
        }
        loss -= weight * log_probs.row(row)?[label];
        let slice = &mut grad.data_mut()[row * cols..(row + 1) * cols];
        slice[label] -= 1.0;
        slice.iter_mut().for_each(|g| *g *= weight);
    }
    Ok((loss, grad))
}

/// Shared inputs for [`build_strategy`].
pub struct StrategyContext<'a> {
    pub config: &'a RunConfig,
    pub forget: &'a ResolvedForget,
    pub embedder: Box<dyn ClassEmbedder>,
}

impl<'a> StrategyContext<'a> {
    /// Uses a hashed trigram embedder sized by `icus.embedding_dim`.
    pub fn new(config: &'a RunConfig, forget: &'a ResolvedForget) -> UnlearnResult<Self> {
        Ok(Self {
            config,
            forget,
            embedder: Box::new(HashedNgramEmbedder::new(config.icus.embedding_dim)?),
        })
    }

    pub fn with_embedder(mut self, embedder: Box<dyn ClassEmbedder>) -> Self {
        self.embedder = embedder;
        self
    }
}

/// Builds the strategy for `kind` around `model`.
pub fn build_strategy(
    kind: StrategyKind,
    model: ResNetClassifier,
    context: &StrategyContext<'_>,
) -> UnlearnResult<Box<dyn UnlearningStrategy>> {
    let config = context.config;
    info!(strategy = %kind, forget = ?context.forget.forget(), "building strategy");
    Ok(match kind {
        StrategyKind::Retrain => Box::new(Supervised::retrain(&model, config)?),
        StrategyKind::Finetune => Box::new(Supervised::finetune(model, config)?),
        StrategyKind::NegGrad => Box::new(NegGrad::new(model, config)?),
        StrategyKind::NegGradPlus => Box::new(NegGradPlus::new(model, config)?),
        StrategyKind::BadTeacher => Box::new(BadTeacher::new(model, config)?),
        StrategyKind::Scrub => Box::new(Scrub::new(model, config)?),
        StrategyKind::Icus => Box::new(IcusSurgery::new(
            model,
            config,
            context.forget,
            context.embedder.as_ref(),
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn kinds_parse_from_every_alias() {
        for (name, kind) in [
            ("retrain", StrategyKind::Retrain),
            ("finetune", StrategyKind::Finetune),
            ("FineTuning", StrategyKind::Finetune),
            ("neggrad", StrategyKind::NegGrad),
            ("neggrad+", StrategyKind::NegGradPlus),
            ("neggradplus", StrategyKind::NegGradPlus),
            ("badT", StrategyKind::BadTeacher),
            ("bad_teacher", StrategyKind::BadTeacher),
            ("scrub", StrategyKind::Scrub),
            ("icus", StrategyKind::Icus),
        ] {
            assert_eq!(name.parse::<StrategyKind>().unwrap(), kind, "{name}");
        }
        assert!(matches!(
            "lora".parse::<StrategyKind>(),
            Err(UnlearnError::UnknownStrategy(name)) if name == "lora"
        ));
    }

    #[test]
    fn names_round_trip() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.name().parse::<StrategyKind>().unwrap(), kind);
        }
    }

    #[test]
    fn weighted_cross_entropy_matches_plain_ce_for_unit_mean_weights() {
        let logits = Tensor::from_vec(2, 3, vec![1.0, 2.0, 0.5, -1.0, 0.0, 3.0]).unwrap();
        let labels = [1usize, 2];
        let (weighted, grad) = weighted_cross_entropy(&logits, &labels, &[0.5, 0.5]).unwrap();
        let (plain, plain_grad) = st_nn::CrossEntropy::new().with_labels(&logits, &labels).unwrap();
        assert_abs_diff_eq!(weighted, plain, epsilon = 1e-6);
        for (a, b) in grad.data().iter().zip(plain_grad.data()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn negative_weights_flip_the_gradient() {
        let logits = Tensor::from_vec(1, 2, vec![0.3, -0.2]).unwrap();
        let (pos, pos_grad) = weighted_cross_entropy(&logits, &[0], &[1.0]).unwrap();
        let (neg, neg_grad) = weighted_cross_entropy(&logits, &[0], &[-1.0]).unwrap();
        assert_abs_diff_eq!(pos, -neg, epsilon = 1e-6);
        assert_abs_diff_eq!(pos_grad.data()[0], -neg_grad.data()[0], epsilon = 1e-6);
    }
}
