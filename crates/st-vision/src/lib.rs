// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Vision backbones for class-level unlearning experiments.
//!
//! [`models::ResNetClassifier`] bundles a residual feature extractor with a
//! linear head, and [`models::WeightSchema`] addresses its logical parameter
//! groups (head rows plus the last block of each stage) for extraction and
//! injection.

pub mod models;

pub use models::{
    ExtractedWeights, GroupedBackbone, ResNetClassifier, ResNetConfig, ResNetPreset, WeightSchema,
};
