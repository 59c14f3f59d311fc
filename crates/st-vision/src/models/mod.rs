// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Vision model backbones implemented on top of the `st-nn` module stack.
//!
//! Each model implements [`st_nn::module::Module`], so optimisers, checkpoint
//! IO and the unlearning strategies drive them through the same surface.

pub mod groups;
pub mod resnet;

pub use self::groups::{ExtractedWeights, GroupedBackbone, WeightSchema, HEAD_GROUP};
pub use self::resnet::{ResNetClassifier, ResNetConfig, ResNetPreset, ResidualBlock};
