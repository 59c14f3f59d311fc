// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Checkpoint file names and model persistence.

use crate::error::UnlearnResult;
use crate::forget::forgetting_set_key;
use serde::{Deserialize, Serialize};
use st_vision::{ResNetClassifier, ResNetPreset};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    Json,
    #[default]
    Bincode,
}

impl CheckpointFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CheckpointFormat::Json => "json",
            CheckpointFormat::Bincode => "bin",
        }
    }

    /// `.json` files are JSON; anything else is treated as bincode.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => CheckpointFormat::Json,
            _ => CheckpointFormat::Bincode,
        }
    }
}

/// Renders checkpoint stems for one dataset and backbone preset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointNaming {
    dataset: String,
    model: String,
}

impl CheckpointNaming {
    pub fn new(dataset: impl Into<String>, preset: ResNetPreset) -> Self {
        Self {
            dataset: dataset.into(),
            model: preset.name().to_lowercase(),
        }
    }

    /// The fully trained model every run starts from.
    pub fn original(&self) -> String {
        format!("{}_{}", self.dataset, self.model)
    }

    pub fn finetuned(&self, forget: &[usize]) -> String {
        format!(
            "{}_forgetting_set_{}_finetuning_{}",
            self.dataset,
            forgetting_set_key(forget),
            self.model
        )
    }

    pub fn retrained(&self, forget: &[usize]) -> String {
        format!(
            "{}_{}_only_retain_set{}",
            self.dataset,
            self.model,
            forgetting_set_key(forget)
        )
    }

    pub fn unlearned(&self, forget_size: usize, method: &str) -> String {
        format!(
            "{}_forgetting_size_{forget_size}_{method}_{}",
            self.dataset, self.model
        )
    }

    /// Stem for a run that forgot individual training samples rather than
    /// classes. Retrain and finetune use their method names here too.
    pub fn unlearned_indices(&self, indices: &[usize], method: &str) -> String {
        format!(
            "{}_forgetting_indices_{}_{method}_{}",
            self.dataset,
            forgetting_set_key(indices),
            self.model
        )
    }

    pub fn path(&self, dir: &Path, stem: &str, format: CheckpointFormat) -> PathBuf {
        dir.join(format!("{stem}.{}", format.extension()))
    }
}

pub fn save_model(
    model: &ResNetClassifier,
    path: &Path,
    format: CheckpointFormat,
) -> UnlearnResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match format {
        CheckpointFormat::Json => model.save_json(path)?,
        CheckpointFormat::Bincode => model.save_bincode(path)?,
    }
    info!(path = %path.display(), "saved checkpoint");
    Ok(())
}

/// Loads weights into `model`, whose architecture must match the file.
pub fn load_model(
    model: &mut ResNetClassifier,
    path: &Path,
    format: CheckpointFormat,
) -> UnlearnResult<()> {
    match format {
        CheckpointFormat::Json => model.load_json(path)?,
        CheckpointFormat::Bincode => model.load_bincode(path)?,
    }
    info!(path = %path.display(), "loaded checkpoint");
    Ok(())
}
