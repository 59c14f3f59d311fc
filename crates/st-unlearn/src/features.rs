// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Penultimate-layer feature export for downstream analysis.

use crate::error::UnlearnResult;
use crate::partition::UnlearningSample;
use st_nn::dataset::DataLoader;
use st_nn::{load_tensor_bincode, save_tensor_bincode, Tensor, TensorError};
use st_vision::ResNetClassifier;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Pooled features and labels, one row each, in loader order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSplit {
    pub features: Tensor,
    pub labels: Vec<usize>,
}

/// Evaluation-mode feature pass over `loader`.
pub fn extract_features(
    model: &ResNetClassifier,
    loader: &DataLoader<UnlearningSample>,
) -> UnlearnResult<FeatureSplit> {
    model.set_training(false);
    let mut rows = Vec::new();
    let mut labels = Vec::with_capacity(loader.len());
    for batch in loader.iter() {
        let batch = batch?;
        rows.push(model.extract_features(&batch.inputs)?);
        labels.extend_from_slice(&batch.labels);
    }
    if rows.is_empty() {
        return Err(TensorError::EmptyInput("feature_loader").into());
    }
    Ok(FeatureSplit {
        features: Tensor::cat_rows(&rows)?,
        labels,
    })
}

/// `(features, labels)` file paths for one split.
pub fn split_paths(dir: &Path, split: &str, method: &str, forget_size: usize) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{split}_features_{method}_{forget_size}.bin")),
        dir.join(format!("{split}_labels_{method}_{forget_size}.bin")),
    )
}

/// Extracts features for `loader` and writes them with their labels.
pub fn export_split(
    model: &ResNetClassifier,
    loader: &DataLoader<UnlearningSample>,
    dir: &Path,
    split: &str,
    method: &str,
    forget_size: usize,
) -> UnlearnResult<FeatureSplit> {
    let extracted = extract_features(model, loader)?;
    fs::create_dir_all(dir)?;
    let (features_path, labels_path) = split_paths(dir, split, method, forget_size);
    save_tensor_bincode(&extracted.features, &features_path)?;
    let labels: Vec<f32> = extracted.labels.iter().map(|&l| l as f32).collect();
    save_tensor_bincode(&Tensor::from_vec(labels.len(), 1, labels)?, &labels_path)?;
    info!(
        split,
        method,
        rows = extracted.labels.len(),
        dim = extracted.features.shape().1,
        "exported features"
    );
    Ok(extracted)
}

pub fn load_split(
    dir: &Path,
    split: &str,
    method: &str,
    forget_size: usize,
) -> UnlearnResult<FeatureSplit> {
    let (features_path, labels_path) = split_paths(dir, split, method, forget_size);
    let features = load_tensor_bincode(&features_path)?;
    let labels = load_tensor_bincode(&labels_path)?;
    if labels.len() != features.shape().0 {
        return Err(TensorError::DataLength {
            expected: features.shape().0,
            got: labels.len(),
        }
        .into());
    }
    Ok(FeatureSplit {
        features,
        labels: labels.data().iter().map(|&l| l as usize).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forget::ForgetSpec;
    use crate::partition::UnlearningDataset;
    use crate::test_support::{labelled_samples, tiny_model};
    use tempfile::tempdir;

    #[test]
    fn exported_splits_reload() {
        let dir = tempdir().unwrap();
        let model = tiny_model(3);
        let forget = ForgetSpec::explicit(vec![1]).resolve(3, 0).unwrap();
        let dataset = UnlearningDataset::wrap_classes(labelled_samples(&[0, 1, 2, 2, 1], 4), &forget).unwrap();
        let loader = dataset.evaluation_loader(2);
        let written = export_split(&model, &loader, dir.path(), "train", "scrub", 1).unwrap();
        assert_eq!(written.features.shape(), (5, model.feature_dim()));
        assert!(dir.path().join("train_features_scrub_1.bin").exists());

        let loaded = load_split(dir.path(), "train", "scrub", 1).unwrap();
        assert_eq!(loaded, written);
        assert_eq!(loaded.labels, vec![0, 1, 2, 2, 1]);
    }
}
