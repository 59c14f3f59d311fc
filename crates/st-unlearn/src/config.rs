// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Immutable run configuration, merged from layered TOML/JSON files.

use crate::error::{UnlearnError, UnlearnResult};
use crate::forget::ForgetSpec;
use crate::strategy::StrategyKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use spiral_config::determinism::rng_from_label;
use spiral_config::{ConfigLayering, LayeredConfig};
use st_vision::ResNetPreset;
use std::path::PathBuf;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub name: String,
    pub num_classes: usize,
    /// Canonical class names, one per class id, fed to the class embedder.
    pub class_names: Vec<String>,
    pub input_channels: usize,
    pub input_hw: (usize, usize),
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "cifar10".to_string(),
            num_classes: 10,
            class_names: [
                "airplane",
                "automobile",
                "bird",
                "cat",
                "deer",
                "dog",
                "frog",
                "horse",
                "ship",
                "truck",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
            input_channels: 3,
            input_hw: (32, 32),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub lr: f32,
    pub epochs: usize,
    pub batch_size: usize,
    /// Background batch prefetch depth; zero loads on the training thread.
    pub prefetch: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            epochs: 5,
            batch_size: 64,
            prefetch: 2,
        }
    }
}

/// Loader the Scrub minimise phase trains on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinimizeOn {
    #[default]
    Full,
    Retain,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    pub alpha: f32,
    pub kd_temperature: f32,
    /// Steps spent maximising on the forget set before switching phase.
    pub msteps: usize,
    /// Total step budget.
    pub train_iters: usize,
    pub minimize_on: MinimizeOn,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            kd_temperature: 4.0,
            msteps: 50,
            train_iters: 120,
            minimize_on: MinimizeOn::Full,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BadTeacherConfig {
    pub kl_temperature: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub plateau_patience: usize,
    pub plateau_factor: f32,
}

impl Default for BadTeacherConfig {
    fn default() -> Self {
        Self {
            kl_temperature: 1.0,
            momentum: 0.9,
            weight_decay: 1e-3,
            plateau_patience: 10,
            plateau_factor: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegGradConfig {
    /// Weight of the negated forget-set term in NegGrad+.
    pub forget_weight: f32,
}

impl Default for NegGradConfig {
    fn default() -> Self {
        Self { forget_weight: 1.0 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcusConfig {
    /// Logical layer indices rewritten by the surgery; `1` is the head.
    pub layers: Vec<usize>,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub epochs: usize,
    pub lr: f32,
    /// How far below the neutral donor's bias a forgotten class is pushed.
    pub forget_margin: f32,
}

impl Default for IcusConfig {
    fn default() -> Self {
        Self {
            layers: vec![1],
            embedding_dim: 32,
            hidden_dim: 64,
            epochs: 200,
            lr: 1e-2,
            forget_margin: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub checkpoint_dir: PathBuf,
    pub registry: PathBuf,
    pub features_dir: PathBuf,
    /// Write the unlearned model next to the original checkpoint.
    pub save_checkpoints: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            registry: PathBuf::from("metrics").join("metrics.json"),
            features_dir: PathBuf::from("data").join("features"),
            save_checkpoints: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// `None` draws a fresh seed at load time.
    pub seed: Option<u64>,
    pub dataset: DatasetConfig,
    pub model: ResNetPreset,
    pub forget: ForgetSpec,
    /// Unlearning method name, parsed with [`StrategyKind::from_str`].
    ///
    /// [`StrategyKind::from_str`]: std::str::FromStr::from_str
    pub method: String,
    pub train: TrainConfig,
    pub scrub: ScrubConfig,
    pub bad_teacher: BadTeacherConfig,
    pub neggrad: NegGradConfig,
    pub icus: IcusConfig,
    pub paths: PathsConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: Some(42),
            dataset: DatasetConfig::default(),
            model: ResNetPreset::Resnet18,
            forget: ForgetSpec::default(),
            method: "scrub".to_string(),
            train: TrainConfig::default(),
            scrub: ScrubConfig::default(),
            bad_teacher: BadTeacherConfig::default(),
            neggrad: NegGradConfig::default(),
            icus: IcusConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl RunConfig {
    /// Merges the configured layers and validates the result.
    pub fn load(layering: ConfigLayering) -> UnlearnResult<Self> {
        let layered = LayeredConfig::load(layering)?;
        let mut config: RunConfig = layered.deserialize()?;
        if config.seed.is_none() {
            let seed = rng_from_label("run-seed").gen::<u32>() as u64;
            info!(seed, "no seed configured, drew one");
            config.seed = Some(seed);
        }
        config.validate()?;
        Ok(config)
    }

    /// Loads from `SPIRAL_CONFIG_*` or the default config root.
    pub fn discover() -> UnlearnResult<Self> {
        Self::load(ConfigLayering::discover())
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(42)
    }

    pub fn strategy_kind(&self) -> UnlearnResult<StrategyKind> {
        self.method.parse()
    }

    pub fn validate(&self) -> UnlearnResult<()> {
        if self.dataset.num_classes == 0 {
            return Err(UnlearnError::Config("dataset.num_classes must be positive".into()));
        }
        if !self.dataset.class_names.is_empty()
            && self.dataset.class_names.len() != self.dataset.num_classes
        {
            return Err(UnlearnError::Config(format!(
                "dataset.class_names lists {} names for {} classes",
                self.dataset.class_names.len(),
                self.dataset.num_classes
            )));
        }
        if self.train.batch_size == 0 {
            return Err(UnlearnError::Config("train.batch_size must be positive".into()));
        }
        if self.icus.layers.is_empty() {
            return Err(UnlearnError::Config("icus.layers must not be empty".into()));
        }
        self.strategy_kind()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forget::ForgetPolicy;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn run_layer_overrides_base_toml() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.toml");
        let run = dir.path().join("run.json");
        fs::write(
            &base,
            "method = \"badT\"\nseed = 7\n[train]\nlr = 0.01\nepochs = 3\n[forget]\npolicy = \"random_of_size\"\nsize = 2\n",
        )
        .unwrap();
        fs::write(&run, r#"{"train": {"epochs": 9}, "model": "resnet9"}"#).unwrap();
        let config = RunConfig::load(ConfigLayering::default().with_base(&base).with_run(&run)).unwrap();
        assert_eq!(config.seed(), 7);
        assert_eq!(config.train.epochs, 9);
        assert_eq!(config.train.lr, 0.01);
        assert_eq!(config.model, ResNetPreset::Resnet9);
        assert_eq!(config.forget.policy, ForgetPolicy::RandomOfSize);
        assert_eq!(config.strategy_kind().unwrap(), StrategyKind::BadTeacher);
        assert_eq!(config.scrub.msteps, 50);
        assert_eq!(config.scrub.minimize_on, MinimizeOn::Full);
    }

    #[test]
    fn scrub_minimize_set_reads_from_json() {
        let dir = tempdir().unwrap();
        let run = dir.path().join("run.json");
        fs::write(&run, r#"{"scrub": {"minimize_on": "retain"}}"#).unwrap();
        let config = RunConfig::load(ConfigLayering::default().with_run(&run)).unwrap();
        assert_eq!(config.scrub.minimize_on, MinimizeOn::Retain);
    }

    #[test]
    fn unknown_methods_fail_validation() {
        let config = RunConfig {
            method: "ssd".to_string(),
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(UnlearnError::UnknownStrategy(name)) if name == "ssd"
        ));
    }

    #[test]
    fn class_names_must_cover_every_class() {
        let mut config = RunConfig::default();
        config.dataset.class_names.pop();
        assert!(matches!(config.validate(), Err(UnlearnError::Config(_))));
    }
}
