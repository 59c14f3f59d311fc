// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{guard_shapes, Loss};
use crate::{PureResult, Tensor};

/// Mean squared error averaged over every element.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    pub fn new() -> Self {
        Self
    }
}

impl Loss for MeanSquaredError {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        guard_shapes(prediction, target)?;
        let value = st_tensor::pure::mean_squared_error(prediction, target)?;
        Tensor::from_vec(1, 1, vec![value])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        guard_shapes(prediction, target)?;
        let scale = 2.0 / prediction.len() as f32;
        prediction.sub(target)?.scale(scale)
    }
}
