// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use spiral_config::LayeredConfigError;
use st_tensor::TensorError;
use thiserror::Error;

/// Result alias used across the unlearning crate.
pub type UnlearnResult<T> = std::result::Result<T, UnlearnError>;

#[derive(Error, Debug)]
pub enum UnlearnError {
    #[error("unlearning method '{0}' not recognised")]
    UnknownStrategy(String),
    #[error("invalid forgetting set: {0}")]
    InvalidForgetSpec(String),
    #[error("no case for method '{method}' and forgetting set {forgetting_set} in dataset '{dataset}'")]
    CaseNotFound {
        dataset: String,
        method: String,
        forgetting_set: String,
    },
    #[error("case for method '{method}' and forgetting set {forgetting_set} has no forget accuracy")]
    MissingForgetAccuracy {
        method: String,
        forgetting_set: String,
    },
    #[error("dataset '{0}' not found in the case registry")]
    DatasetNotFound(String),
    #[error("case registry at {path} was modified by another writer")]
    RegistryConflict { path: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl From<LayeredConfigError> for UnlearnError {
    fn from(err: LayeredConfigError) -> Self {
        UnlearnError::Config(err.to_string())
    }
}
