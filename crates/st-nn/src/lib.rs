// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Lightweight `nn.Module` style surface kept entirely in Rust.
//!
//! Layers follow a recompute-on-backward contract: `forward` borrows the
//! module immutably, `backward` receives the original input together with the
//! upstream gradient and accumulates parameter gradients before returning the
//! gradient with respect to the input. Losses return batch-mean gradients so
//! layers never rescale by the batch size themselves.

pub mod dataset;
pub mod io;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

pub use dataset::{Batches, Collate, DataLoader};
pub use io::{
    load_bincode, load_json, load_tensor_bincode, save_bincode, save_json, save_tensor_bincode,
};
pub use layers::conv::{AvgPool2d, Conv2d, MaxPool2d};
pub use layers::linear::Linear;
pub use layers::normalization::BatchNorm2d;
pub use layers::Relu;
pub use loss::{CrossEntropy, DistillationKl, Loss, MeanSquaredError};
pub use module::{Module, Parameter};
pub use optim::{AdamW, LrScheduler, Optimizer, ReduceLrOnPlateau, Sgd};

pub use st_tensor::{PureResult, Tensor, TensorError};
