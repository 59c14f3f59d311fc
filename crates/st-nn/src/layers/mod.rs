// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod conv;
pub mod linear;
pub mod normalization;

pub use activation::Relu;

use crate::{PureResult, Tensor, TensorError};

/// Samples a `(rows, cols)` matrix from the Xavier/Glorot uniform
/// distribution `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`.
pub fn xavier_uniform(
    rows: usize,
    cols: usize,
    fan_in: usize,
    fan_out: usize,
    seed: Option<u64>,
) -> PureResult<Tensor> {
    if fan_in + fan_out == 0 {
        return Err(TensorError::InvalidValue {
            label: "xavier_fan",
        });
    }
    let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Tensor::random_uniform(rows, cols, -bound, bound, seed)
}

pub(crate) fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

pub(crate) fn guard_columns(input: &Tensor, expected: usize) -> PureResult<()> {
    let cols = input.shape().1;
    if cols != expected {
        return Err(TensorError::ShapeMismatch {
            left: (1, cols),
            right: (1, expected),
        });
    }
    Ok(())
}
