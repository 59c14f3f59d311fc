// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Gradient ascent on the forget partition, alone or balanced against
//! descent on the retain partition.

use super::{
    run_epochs, sealed, weighted_cross_entropy, ForwardOutput, StrategyKind, UnlearnReport,
    UnlearningStrategy,
};
use crate::config::RunConfig;
use crate::error::UnlearnResult;
use crate::partition::UnlearningLoaders;
use st_nn::module::Module;
use st_nn::optim::Optimizer;
use st_nn::{AdamW, CrossEntropy, Tensor};
use st_vision::ResNetClassifier;

/// Maximises cross-entropy on the forget loader.
pub struct NegGrad {
    model: ResNetClassifier,
    optimizer: AdamW,
    criterion: CrossEntropy,
    epochs: usize,
}

impl NegGrad {
    pub fn new(model: ResNetClassifier, config: &RunConfig) -> UnlearnResult<Self> {
        Ok(Self {
            model,
            optimizer: AdamW::new(config.train.lr)?,
            criterion: CrossEntropy::new(),
            epochs: config.train.epochs,
        })
    }
}

impl sealed::Sealed for NegGrad {}

impl UnlearningStrategy for NegGrad {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NegGrad
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
        Ok(ForwardOutput {
            logits,
            loss: -loss,
            grad: grad.scale(-1.0)?,
        })
    }

    fn unlearn(&mut self, loaders: &UnlearningLoaders) -> UnlearnResult<UnlearnReport> {
        let epochs = self.epochs;
        run_epochs(self, &loaders.forget, epochs, loaders.validation.as_ref())
    }

    fn into_model(self: Box<Self>) -> ResNetClassifier {
        self.model
    }
}

/// Per batch: `CE(retain rows) − forget_weight · CE(forget rows)`, each term
/// averaged over its own rows.
pub struct NegGradPlus {
    model: ResNetClassifier,
    optimizer: AdamW,
    forget_weight: f32,
    epochs: usize,
}

impl NegGradPlus {
    pub fn new(model: ResNetClassifier, config: &RunConfig) -> UnlearnResult<Self> {
        Ok(Self {
            model,
            optimizer: AdamW::new(config.train.lr)?,
            forget_weight: config.neggrad.forget_weight,
            epochs: config.train.epochs,
        })
    }

    /// Row weights for one batch.
    pub fn row_weights(&self, forget_flags: &[bool]) -> Vec<f32> {
        let forget = forget_flags.iter().filter(|flag| **flag).count();
        let retain = forget_flags.len() - forget;
        forget_flags
            .iter()
            .map(|&flag| {
                if flag {
                    -self.forget_weight / forget as f32
                } else {
                    1.0 / retain as f32
                }
            })
            .collect()
    }
}

impl sealed::Sealed for NegGradPlus {}

impl UnlearningStrategy for NegGradPlus {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NegGradPlus
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
        forget_flags: &[bool],
    ) -> UnlearnResult<ForwardOutput> {
        let logits = self.model.forward(inputs)?;
        let weights = self.row_weights(forget_flags);
        let (loss, grad) = weighted_cross_entropy(&logits, labels, &weights)?;
        Ok(ForwardOutput { logits, loss, grad })
    }

    fn unlearn(&mut self, loaders: &UnlearningLoaders) -> UnlearnResult<UnlearnReport> {
        let epochs = self.epochs;
        run_epochs(self, &loaders.full, epochs, loaders.validation.as_ref())
    }

    fn into_model(self: Box<Self>) -> ResNetClassifier {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tiny_model;
    use approx::assert_abs_diff_eq;

    #[test]
    fn row_weights_balance_both_partitions() {
        let config = RunConfig::default();
        let strategy = NegGradPlus::new(tiny_model(3), &config).unwrap();
        let weights = strategy.row_weights(&[false, true, false, false]);
        assert_abs_diff_eq!(weights[0], 1.0 / 3.0);
        assert_abs_diff_eq!(weights[1], -1.0);
        assert_abs_diff_eq!(weights.iter().filter(|w| **w > 0.0).sum::<f32>(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn neggrad_negates_cross_entropy() {
        let config = RunConfig::default();
        let mut strategy = NegGrad::new(tiny_model(3), &config).unwrap();
        let inputs = crate::test_support::inputs(2, 11);
        let logits = strategy.model().forward(&inputs).unwrap();
        let (ce, _) = CrossEntropy::new().with_labels(&logits, &[0, 2]).unwrap();
        let output = strategy.forward_pass(&inputs, &[0, 2], &[true, true]).unwrap();
        assert_abs_diff_eq!(output.loss, -ce, epsilon = 1e-5);
    }
}
