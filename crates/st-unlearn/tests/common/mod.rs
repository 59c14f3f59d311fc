// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

#![allow(dead_code)]

use st_tensor::Tensor;
use st_unlearn::config::DatasetConfig;
use st_unlearn::{ForgetSpec, LabeledSample, RunConfig};
use st_vision::{ResNetClassifier, ResNetConfig, ResNetPreset};

pub const CLASSES: usize = 3;

pub fn toy_config() -> ResNetConfig {
    ResNetConfig {
        input_channels: 1,
        input_hw: (4, 4),
        stem_channels: 3,
        stem_kernel: (3, 3),
        stem_stride: (1, 1),
        stem_padding: (1, 1),
        use_max_pool: false,
        stage_channels: vec![3, 4],
        num_classes: CLASSES,
    }
}

pub fn toy_model(seed: u64) -> ResNetClassifier {
    ResNetClassifier::new(toy_config(), seed).unwrap()
}

/// `per_class` noisy 1x4x4 images per class; class `c` is centred on `2c`.
pub fn toy_samples(per_class: usize, seed: u64) -> Vec<LabeledSample> {
    let mut samples = Vec::with_capacity(per_class * CLASSES);
    for i in 0..per_class {
        for class in 0..CLASSES {
            let input = Tensor::random_normal(
                1,
                16,
                2.0 * class as f32,
                0.3,
                Some(seed * 1_000 + (i * CLASSES + class) as u64),
            )
            .unwrap();
            samples.push((input, class));
        }
    }
    samples
}

pub fn run_config(method: &str) -> RunConfig {
    let mut config = RunConfig {
        seed: Some(11),
        method: method.to_string(),
        model: ResNetPreset::ResnetCustom,
        forget: ForgetSpec::explicit(vec![1]),
        dataset: DatasetConfig {
            name: "toy".to_string(),
            num_classes: CLASSES,
            class_names: vec!["cat".into(), "dog".into(), "truck".into()],
            input_channels: 1,
            input_hw: (4, 4),
        },
        ..RunConfig::default()
    };
    config.train.lr = 1e-2;
    config.train.epochs = 2;
    config.train.batch_size = 4;
    config.train.prefetch = 0;
    config.scrub.msteps = 1;
    config.scrub.train_iters = 3;
    config.icus.embedding_dim = 8;
    config.icus.hidden_dim = 8;
    config.icus.epochs = 20;
    config
}

pub fn finite(model: &ResNetClassifier) -> bool {
    use st_nn::module::Module;
    let mut ok = true;
    model
        .visit_parameters(&mut |param| {
            ok &= param.value().data().iter().all(|v| v.is_finite());
            Ok(())
        })
        .unwrap();
    ok
}
