// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_nn::loss::{CrossEntropy, Loss};
use st_nn::module::Module;
use st_nn::optim::{Optimizer, Sgd};
use st_tensor::{Tensor, TensorError};
use tempfile::tempdir;

use st_vision::models::{ResNetClassifier, ResNetConfig, ResNetPreset, WeightSchema};

fn sample_input(batch: usize, channels: usize, hw: (usize, usize), seed: u64) -> Tensor {
    Tensor::random_normal(batch, channels * hw.0 * hw.1, 0.0, 1.0, Some(seed)).unwrap()
}

fn small_resnet(num_classes: usize, seed: u64) -> ResNetClassifier {
    let config = ResNetConfig {
        input_channels: 2,
        input_hw: (8, 8),
        stem_channels: 4,
        stem_kernel: (3, 3),
        stem_stride: (1, 1),
        stem_padding: (1, 1),
        use_max_pool: true,
        stage_channels: vec![4, 6, 8],
        num_classes,
    };
    ResNetClassifier::new(config, seed).unwrap()
}

/// One SGD step so every tensor, running statistics included, moves away from
/// its initial value.
fn trained(mut model: ResNetClassifier) -> ResNetClassifier {
    let input = sample_input(4, 2, (8, 8), 3);
    let labels = [0usize, 1, 2, 0];
    let logits = model.forward(&input).unwrap();
    let (_, grad) = CrossEntropy::new().with_labels(&logits, &labels).unwrap();
    model.backward(&input, &grad).unwrap();
    Sgd::new(0.05, 0.0, 0.0).unwrap().step(&mut model).unwrap();
    model
}

#[test]
fn presets_produce_logits_for_every_sample() {
    let resnet9 = ResNetClassifier::from_preset(ResNetPreset::Resnet9, 3, (8, 8), 5, 1).unwrap();
    let logits = resnet9.forward(&sample_input(2, 3, (8, 8), 7)).unwrap();
    assert_eq!(logits.shape(), (2, 5));
    assert_eq!(resnet9.stage_count(), 2);
    assert_eq!(resnet9.feature_dim(), 128);

    let custom =
        ResNetClassifier::from_preset(ResNetPreset::ResnetCustom, 3, (16, 16), 4, 1).unwrap();
    let features = custom
        .extract_features(&sample_input(1, 3, (16, 16), 9))
        .unwrap();
    assert_eq!(features.shape(), (1, 128));
    assert_eq!(custom.stage_count(), 4);
}

#[test]
fn backward_reaches_every_parameter() {
    let mut model = small_resnet(3, 5);
    let input = sample_input(3, 2, (8, 8), 13);
    let logits = model.forward(&input).unwrap();
    let grad = CrossEntropy::new()
        .backward(&logits, &Tensor::one_hot(&[0, 1, 2], 3).unwrap())
        .unwrap();
    let grad_input = model.backward(&input, &grad).unwrap();
    assert_eq!(grad_input.shape(), input.shape());
    model
        .visit_parameters(&mut |param| {
            assert!(param.gradient().is_some(), "{} has no gradient", param.name());
            Ok(())
        })
        .unwrap();
}

#[test]
fn extract_then_inject_is_bit_exact() {
    let mut model = trained(small_resnet(3, 21));
    let before = model.state_dict().unwrap();
    for indices in [vec![1], vec![2], vec![1, 2, 3, 4], vec![4, 1, 3]] {
        let schema = WeightSchema::build(&model, &indices).unwrap();
        let weights = schema.extract(&model).unwrap();
        schema
            .inject(&mut model, &weights.distinct, &weights.shared)
            .unwrap();
        assert_eq!(model.state_dict().unwrap(), before, "indices {indices:?}");
    }
}

#[test]
fn convenience_accessors_follow_the_schema() {
    let mut model = small_resnet(3, 8);
    let weights = model.extract(&[1, 2]).unwrap();
    assert_eq!(weights.distinct.len(), 3);
    assert_eq!(weights.distinct[0].len(), model.feature_dim() + 1);

    let zeroed: Vec<f32> = vec![0.0; weights.shared.len()];
    model.inject(&weights.distinct, &zeroed, &[1, 2]).unwrap();
    let deepest = model.stage(2).unwrap();
    assert!(deepest.conv2().weight().value().data().iter().all(|v| *v == 0.0));
    assert!(deepest.bn2().gamma().value().data().iter().all(|v| *v == 0.0));
}

#[test]
fn unknown_layer_indices_are_rejected() {
    let model = small_resnet(3, 2);
    let err = model.extract(&[1, 5]).unwrap_err();
    assert!(matches!(err, TensorError::UnknownParameterGroup { index: 5 }));
    assert_eq!(err.to_string(), "unknown layer: 5");
    assert!(model.extract(&[0]).is_err());
}

#[test]
fn checkpoints_restore_evaluation_outputs_exactly() {
    let model = trained(small_resnet(3, 31));
    let dir = tempdir().unwrap();
    let input = sample_input(2, 2, (8, 8), 41);
    model.set_training(false);
    let expected = model.forward(&input).unwrap();

    for file in ["original.json", "original.bin"] {
        let path = dir.path().join(file);
        let mut restored = small_resnet(3, 99);
        if file.ends_with(".json") {
            model.save_json(&path).unwrap();
            restored.load_json(&path).unwrap();
        } else {
            model.save_bincode(&path).unwrap();
            restored.load_bincode(&path).unwrap();
        }
        restored.set_training(false);
        assert_eq!(restored.forward(&input).unwrap(), expected);
    }
}

#[test]
fn snapshots_are_independent_of_the_live_model() {
    let mut live = small_resnet(3, 17);
    let frozen = live.snapshot().unwrap();
    let weights = live.extract(&[1]).unwrap();
    let flipped: Vec<Vec<f32>> = weights
        .distinct
        .iter()
        .map(|row| row.iter().map(|v| -v - 1.0).collect())
        .collect();
    live.inject(&flipped, &[], &[1]).unwrap();
    assert_eq!(frozen.extract(&[1]).unwrap(), weights);
    assert_ne!(live.extract(&[1]).unwrap(), weights);
}

#[test]
fn snapshots_start_without_pending_gradients() {
    let mut live = small_resnet(3, 21);
    let input = sample_input(2, 2, (8, 8), 5);
    let logits = live.forward(&input).unwrap();
    let (_, grad) = CrossEntropy::new().with_labels(&logits, &[0, 2]).unwrap();
    live.backward(&input, &grad).unwrap();

    let mut pending = 0;
    live.visit_parameters(&mut |param| {
        pending += usize::from(param.gradient().is_some());
        Ok(())
    })
    .unwrap();
    assert!(pending > 0);

    let frozen = live.snapshot().unwrap();
    frozen
        .visit_parameters(&mut |param| {
            assert!(param.gradient().is_none(), "{} kept a gradient", param.name());
            Ok(())
        })
        .unwrap();
}

#[test]
fn xavier_reinitialisation_keeps_normalisation_layers() {
    let original = trained(small_resnet(3, 4));
    let mut random = original.snapshot().unwrap();
    random.reinitialize_xavier(1234).unwrap();
    let before = original.state_dict().unwrap();
    let after = random.state_dict().unwrap();
    assert_eq!(before["stage0.bn1::gamma"], after["stage0.bn1::gamma"]);
    assert_eq!(before["stem.bn::running_mean"], after["stem.bn::running_mean"]);
    assert_ne!(before["stage0.conv1::weight"], after["stage0.conv1::weight"]);
    assert!(after["fc::bias"].data().iter().all(|v| *v == 0.0));
}
