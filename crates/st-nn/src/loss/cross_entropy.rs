// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{guard_shapes, Loss};
use crate::{PureResult, Tensor};

/// Softmax cross entropy on raw logits against one-hot (or soft) targets,
/// averaged over the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    pub fn new() -> Self {
        Self
    }

    /// Convenience wrapper taking integer labels.
    pub fn with_labels(&mut self, logits: &Tensor, labels: &[usize]) -> PureResult<(f32, Tensor)> {
        let target = Tensor::one_hot(labels, logits.shape().1)?;
        let value = self.forward(logits, &target)?;
        let grad = self.backward(logits, &target)?;
        Ok((value.data()[0], grad))
    }
}

impl Loss for CrossEntropy {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        guard_shapes(prediction, target)?;
        let rows = prediction.shape().0;
        let log_probs = prediction.row_log_softmax_with_temperature(1.0)?;
        let total: f32 = log_probs
            .data()
            .iter()
            .zip(target.data().iter())
            .map(|(lp, t)| -t * lp)
            .sum();
        Tensor::from_vec(1, 1, vec![total / rows as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        guard_shapes(prediction, target)?;
        let rows = prediction.shape().0;
        prediction
            .row_softmax()?
            .sub(target)?
            .scale(1.0 / rows as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn uniform_logits_give_log_classes() {
        let mut loss = CrossEntropy::new();
        let logits = Tensor::zeros(2, 4).unwrap();
        let (value, grad) = loss.with_labels(&logits, &[0, 3]).unwrap();
        assert_abs_diff_eq!(value, 4.0f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(grad.data()[0], (0.25 - 1.0) / 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(grad.data()[1], 0.25 / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn confident_correct_prediction_is_cheap() {
        let mut loss = CrossEntropy::new();
        let logits = Tensor::from_vec(1, 3, vec![12.0, 0.0, 0.0]).unwrap();
        let (value, _) = loss.with_labels(&logits, &[0]).unwrap();
        assert!(value < 1e-4);
    }
}
