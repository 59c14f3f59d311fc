// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Class-level machine unlearning on top of the SpiralTorch module stack.
//!
//! A run resolves a forget set, flags the training samples that belong to it,
//! hands retain/forget/full loaders to one of the [`strategy`] implementations
//! and scores the result against the original model. Scores land in a
//! [`registry::CaseRegistry`] from which the aggregate unlearning score is
//! computed.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod forget;
pub mod icus;
pub mod partition;
pub mod registry;
pub mod runner;
pub mod strategy;

pub use checkpoint::{CheckpointFormat, CheckpointNaming};
pub use config::RunConfig;
pub use error::{UnlearnError, UnlearnResult};
pub use evaluation::{aggregate_unlearning_score, aus, classify, split_accuracy, SplitAccuracy};
pub use forget::{forgetting_set_key, ForgetMode, ForgetPolicy, ForgetSpec, ResolvedForget};
pub use icus::{ClassEmbedder, ClassWeightRecord, HashedNgramEmbedder, IcusDataset, WeightMapper};
pub use partition::{
    LabeledSample, LoaderOptions, UnlearningBatch, UnlearningDataset, UnlearningLoaders,
    UnlearningSample,
};
pub use registry::{CaseRecord, CaseRegistry, JsonFileStore, MemoryStore, RegistryStore};
pub use runner::{run_unlearning, RunOutcome};
pub use strategy::{build_strategy, StrategyContext, StrategyKind, UnlearnReport, UnlearningStrategy};
