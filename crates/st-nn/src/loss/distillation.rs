// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{guard_shapes, Loss};
use crate::{PureResult, Tensor, TensorError};

/// `KL(teacher || softmax(student / T))` with batch-mean reduction.
///
/// `prediction` holds student logits, `target` holds teacher probabilities
/// that already went through the temperature softmax. The value is multiplied
/// by `scale`, which callers set to `T^2` for classic knowledge distillation.
#[derive(Debug, Clone, Copy)]
pub struct DistillationKl {
    temperature: f32,
    scale: f32,
}

impl DistillationKl {
    pub fn new(temperature: f32, scale: f32) -> PureResult<Self> {
        if !(temperature > 0.0) {
            return Err(TensorError::NonPositiveTemperature { temperature });
        }
        Ok(Self { temperature, scale })
    }

    /// Hinton-style distillation: `scale = T^2`.
    pub fn hinton(temperature: f32) -> PureResult<Self> {
        Self::new(temperature, temperature * temperature)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }
}

impl Loss for DistillationKl {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        guard_shapes(prediction, target)?;
        let rows = prediction.shape().0;
        let log_q = prediction.row_log_softmax_with_temperature(self.temperature)?;
        let total: f32 = target
            .data()
            .iter()
            .zip(log_q.data().iter())
            .map(|(p, lq)| if *p > 0.0 { p * (p.ln() - lq) } else { 0.0 })
            .sum();
        Tensor::from_vec(1, 1, vec![self.scale * total / rows as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        guard_shapes(prediction, target)?;
        let rows = prediction.shape().0;
        prediction
            .row_softmax_with_temperature(self.temperature)?
            .sub(target)?
            .scale(self.scale / (self.temperature * rows as f32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn matching_distributions_have_zero_divergence() {
        let logits = Tensor::from_vec(2, 3, vec![1.0, 2.0, 0.5, -1.0, 0.0, 1.0]).unwrap();
        let mut kd = DistillationKl::hinton(4.0).unwrap();
        let teacher = logits.row_softmax_with_temperature(4.0).unwrap();
        let value = kd.forward(&logits, &teacher).unwrap();
        assert_abs_diff_eq!(value.data()[0], 0.0, epsilon = 1e-5);
        let grad = kd.backward(&logits, &teacher).unwrap();
        assert!(grad.data().iter().all(|g| g.abs() < 1e-6));
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let logits = Tensor::from_vec(1, 3, vec![0.2, -0.4, 1.1]).unwrap();
        let teacher = Tensor::from_vec(1, 3, vec![0.7, 0.2, 0.1]).unwrap();
        let mut kd = DistillationKl::hinton(2.0).unwrap();
        let grad = kd.backward(&logits, &teacher).unwrap();
        let base = kd.forward(&logits, &teacher).unwrap().data()[0];
        let eps = 1e-3;
        let mut bumped = logits.clone();
        bumped.data_mut()[0] += eps;
        let shifted = kd.forward(&bumped, &teacher).unwrap().data()[0];
        assert_abs_diff_eq!((shifted - base) / eps, grad.data()[0], epsilon = 1e-2);
    }

    #[test]
    fn rejects_non_positive_temperature() {
        assert!(DistillationKl::new(0.0, 1.0).is_err());
    }
}
