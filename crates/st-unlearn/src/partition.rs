// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Wraps a labelled dataset with per-sample forget flags and builds the
//! retain, forget and full loaders the strategies consume.

use crate::error::{UnlearnError, UnlearnResult};
use crate::forget::ResolvedForget;
use spiral_config::determinism::derive_seed;
use st_nn::dataset::{Collate, DataLoader};
use st_nn::PureResult;
use st_tensor::{Tensor, TensorError};
use std::collections::BTreeSet;
use tracing::info;

/// A `(1, features)` input with its class label.
pub type LabeledSample = (Tensor, usize);

#[derive(Clone, Debug, PartialEq)]
pub struct UnlearningSample {
    /// Position in the original dataset.
    pub index: usize,
    pub input: Tensor,
    pub label: usize,
    pub forget: bool,
}

/// Stacked samples. `inputs` has one row per sample.
#[derive(Clone, Debug, PartialEq)]
pub struct UnlearningBatch {
    pub inputs: Tensor,
    pub labels: Vec<usize>,
    pub forget_flags: Vec<bool>,
}

impl UnlearningBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn forget_count(&self) -> usize {
        self.forget_flags.iter().filter(|flag| **flag).count()
    }
}

impl Collate for UnlearningSample {
    type Batch = UnlearningBatch;

    fn collate(samples: &[&Self]) -> PureResult<Self::Batch> {
        if samples.is_empty() {
            return Err(TensorError::EmptyInput("unlearning_batch"));
        }
        let rows: Vec<Tensor> = samples.iter().map(|s| s.input.clone()).collect();
        Ok(UnlearningBatch {
            inputs: Tensor::cat_rows(&rows)?,
            labels: samples.iter().map(|s| s.label).collect(),
            forget_flags: samples.iter().map(|s| s.forget).collect(),
        })
    }
}

/// Loader settings shared by every loader a dataset hands out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub prefetch: usize,
    pub seed: u64,
}

/// Loaders consumed by [`crate::strategy::UnlearningStrategy::unlearn`].
pub struct UnlearningLoaders {
    pub retain: DataLoader<UnlearningSample>,
    pub forget: DataLoader<UnlearningSample>,
    pub full: DataLoader<UnlearningSample>,
    pub validation: Option<DataLoader<UnlearningSample>>,
}

impl UnlearningLoaders {
    pub fn with_validation(mut self, validation: DataLoader<UnlearningSample>) -> Self {
        self.validation = Some(validation);
        self
    }
}

fn shuffled(
    samples: Vec<UnlearningSample>,
    options: LoaderOptions,
    label: &str,
) -> DataLoader<UnlearningSample> {
    DataLoader::from_vec(samples)
        .shuffle(derive_seed(options.seed, label))
        .batched(options.batch_size)
        .prefetch(options.prefetch)
}

/// Training set where every sample carries its forget flag.
#[derive(Clone, Debug)]
pub struct UnlearningDataset {
    samples: Vec<UnlearningSample>,
}

impl UnlearningDataset {
    /// Flags samples whose label is in the resolved forget set.
    pub fn wrap_classes(samples: Vec<LabeledSample>, forget: &ResolvedForget) -> UnlearnResult<Self> {
        let flags = forget.flags();
        let wrapped = samples
            .into_iter()
            .enumerate()
            .map(|(index, (input, label))| {
                let flag = flags.get(label).copied().ok_or_else(|| {
                    UnlearnError::InvalidForgetSpec(format!(
                        "sample {index} has label {label} outside [0, {})",
                        forget.num_classes()
                    ))
                })?;
                Ok(UnlearningSample {
                    index,
                    input,
                    label,
                    forget: flag,
                })
            })
            .collect::<UnlearnResult<Vec<_>>>()?;
        Self::from_samples(wrapped)
    }

    /// Flags samples whose dataset position is listed in `forget_indices`.
    pub fn wrap_indices(samples: Vec<LabeledSample>, forget_indices: &[usize]) -> UnlearnResult<Self> {
        let len = samples.len();
        if let Some(bad) = forget_indices.iter().find(|&&i| i >= len) {
            return Err(UnlearnError::InvalidForgetSpec(format!(
                "index {bad} outside a dataset of {len} samples"
            )));
        }
        let lookup: BTreeSet<usize> = forget_indices.iter().copied().collect();
        let wrapped = samples
            .into_iter()
            .enumerate()
            .map(|(index, (input, label))| UnlearningSample {
                index,
                input,
                label,
                forget: lookup.contains(&index),
            })
            .collect();
        Self::from_samples(wrapped)
    }

    fn from_samples(samples: Vec<UnlearningSample>) -> UnlearnResult<Self> {
        if let Some(sample) = samples.iter().find(|s| s.input.shape().0 != 1) {
            return Err(TensorError::ShapeMismatch {
                left: (1, sample.input.shape().1),
                right: sample.input.shape(),
            }
            .into());
        }
        let dataset = Self { samples };
        info!(
            samples = dataset.len(),
            retain = dataset.retain_count(),
            forget = dataset.forget_count(),
            "wrapped unlearning dataset"
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[UnlearningSample] {
        &self.samples
    }

    pub fn retain_count(&self) -> usize {
        self.samples.iter().filter(|s| !s.forget).count()
    }

    pub fn forget_count(&self) -> usize {
        self.samples.iter().filter(|s| s.forget).count()
    }

    /// Original positions of the flagged samples.
    pub fn forget_indices(&self) -> Vec<usize> {
        self.samples
            .iter()
            .filter(|s| s.forget)
            .map(|s| s.index)
            .collect()
    }

    fn subset(&self, keep: impl Fn(&UnlearningSample) -> bool) -> Vec<UnlearningSample> {
        self.samples.iter().filter(|s| keep(s)).cloned().collect()
    }

    pub fn retain_loader(&self, options: LoaderOptions) -> DataLoader<UnlearningSample> {
        shuffled(self.subset(|s| !s.forget), options, "retain-loader")
    }

    pub fn forget_loader(&self, options: LoaderOptions) -> DataLoader<UnlearningSample> {
        shuffled(self.subset(|s| s.forget), options, "forget-loader")
    }

    pub fn full_loader(&self, options: LoaderOptions) -> DataLoader<UnlearningSample> {
        shuffled(self.samples.clone(), options, "full-loader")
    }

    /// Unshuffled loader over every sample, for evaluation passes.
    pub fn evaluation_loader(&self, batch_size: usize) -> DataLoader<UnlearningSample> {
        DataLoader::from_vec(self.samples.clone()).batched(batch_size)
    }

    pub fn loaders(&self, options: LoaderOptions) -> UnlearningLoaders {
        UnlearningLoaders {
            retain: self.retain_loader(options),
            forget: self.forget_loader(options),
            full: self.full_loader(options),
            validation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forget::ForgetSpec;

    fn labelled(labels: &[usize]) -> Vec<LabeledSample> {
        labels
            .iter()
            .map(|&label| (Tensor::full(1, 2, label as f32).unwrap(), label))
            .collect()
    }

    fn options() -> LoaderOptions {
        LoaderOptions {
            batch_size: 2,
            prefetch: 0,
            seed: 3,
        }
    }

    #[test]
    fn class_flags_follow_labels() {
        let forget = ForgetSpec::explicit(vec![1]).resolve(3, 0).unwrap();
        let dataset = UnlearningDataset::wrap_classes(labelled(&[0, 1, 2, 1, 0]), &forget).unwrap();
        let flags: Vec<bool> = dataset.samples().iter().map(|s| s.forget).collect();
        assert_eq!(flags, vec![false, true, false, true, false]);
        assert_eq!(dataset.forget_indices(), vec![1, 3]);
    }

    #[test]
    fn out_of_range_labels_are_rejected() {
        let forget = ForgetSpec::explicit(vec![0]).resolve(2, 0).unwrap();
        assert!(UnlearningDataset::wrap_classes(labelled(&[0, 5]), &forget).is_err());
        assert!(UnlearningDataset::wrap_indices(labelled(&[0, 1]), &[2]).is_err());
    }

    #[test]
    fn loaders_split_by_flag() {
        let dataset = UnlearningDataset::wrap_indices(labelled(&[0, 0, 1, 1, 2]), &[0, 4]).unwrap();
        let loaders = dataset.loaders(options());
        assert_eq!(loaders.retain.len(), 3);
        assert_eq!(loaders.forget.len(), 2);
        assert_eq!(loaders.full.len(), 5);
        for batch in loaders.forget.iter() {
            assert!(batch.unwrap().forget_flags.iter().all(|f| *f));
        }
        for batch in loaders.retain.iter() {
            assert_eq!(batch.unwrap().forget_count(), 0);
        }
    }

    #[test]
    fn evaluation_loader_keeps_dataset_order() {
        let dataset = UnlearningDataset::wrap_indices(labelled(&[2, 0, 1]), &[]).unwrap();
        let labels: Vec<usize> = dataset
            .evaluation_loader(2)
            .iter()
            .flat_map(|b| b.unwrap().labels)
            .collect();
        assert_eq!(labels, vec![2, 0, 1]);
    }
}
