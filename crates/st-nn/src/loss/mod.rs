// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod cross_entropy;
mod distillation;
mod mean_squared_error;

use crate::{PureResult, Tensor, TensorError};

pub use cross_entropy::CrossEntropy;
pub use distillation::DistillationKl;
pub use mean_squared_error::MeanSquaredError;

/// Trait implemented by differentiable losses that operate directly on
/// tensors. Gradients are already averaged over the batch.
pub trait Loss {
    /// Computes the loss value as a `1 x 1` tensor.
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;

    /// Returns the gradient of the loss with respect to the predictions.
    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;
}

fn guard_shapes(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
    if prediction.shape() != target.shape() {
        return Err(TensorError::ShapeMismatch {
            left: prediction.shape(),
            right: target.shape(),
        });
    }
    Ok(())
}

/// Reads the scalar out of a loss tensor.
pub fn scalar(loss: &Tensor) -> f32 {
    loss.data()[0]
}
