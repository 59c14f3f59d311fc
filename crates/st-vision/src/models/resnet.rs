// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::groups::{ExtractedWeights, GroupedBackbone, WeightSchema, HEAD_GROUP};
use serde::{Deserialize, Serialize};
use spiral_config::determinism::derive_seed;
use st_nn::io;
use st_nn::layers::activation::Relu;
use st_nn::layers::conv::{AvgPool2d, Conv2d, MaxPool2d};
use st_nn::layers::linear::Linear;
use st_nn::layers::normalization::BatchNorm2d;
use st_nn::module::{Module, Parameter};
use st_nn::PureResult;
use st_tensor::{Tensor, TensorError};
use std::fmt;
use std::str::FromStr;

/// Named architecture presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResNetPreset {
    #[serde(alias = "ResNet9")]
    Resnet9,
    #[serde(alias = "ResNet18")]
    Resnet18,
    #[serde(alias = "ResNetCustom")]
    ResnetCustom,
}

impl ResNetPreset {
    pub fn name(&self) -> &'static str {
        match self {
            ResNetPreset::Resnet9 => "ResNet9",
            ResNetPreset::Resnet18 => "ResNet18",
            ResNetPreset::ResnetCustom => "ResNetCustom",
        }
    }

    pub fn config(
        &self,
        input_channels: usize,
        input_hw: (usize, usize),
        num_classes: usize,
    ) -> ResNetConfig {
        match self {
            ResNetPreset::Resnet9 => ResNetConfig::resnet9(input_channels, input_hw, num_classes),
            ResNetPreset::Resnet18 => ResNetConfig::resnet18(input_channels, input_hw, num_classes),
            ResNetPreset::ResnetCustom => {
                ResNetConfig::resnet_custom(input_channels, input_hw, num_classes)
            }
        }
    }
}

impl fmt::Display for ResNetPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResNetPreset {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "resnet9" => Ok(ResNetPreset::Resnet9),
            "resnet18" => Ok(ResNetPreset::Resnet18),
            "resnetcustom" => Ok(ResNetPreset::ResnetCustom),
            _ => Err(TensorError::InvalidValue {
                label: "resnet_preset",
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResNetConfig {
    pub input_channels: usize,
    pub input_hw: (usize, usize),
    pub stem_channels: usize,
    pub stem_kernel: (usize, usize),
    pub stem_stride: (usize, usize),
    pub stem_padding: (usize, usize),
    /// 3x3 stride-2 max pool after the stem.
    pub use_max_pool: bool,
    /// Output channels per stage; one residual block each. Stage 0 keeps the
    /// resolution, every later stage halves it.
    pub stage_channels: Vec<usize>,
    pub num_classes: usize,
}

impl ResNetConfig {
    pub fn resnet9(input_channels: usize, input_hw: (usize, usize), num_classes: usize) -> Self {
        Self {
            input_channels,
            input_hw,
            stem_channels: 64,
            stem_kernel: (3, 3),
            stem_stride: (1, 1),
            stem_padding: (1, 1),
            use_max_pool: false,
            stage_channels: vec![64, 128],
            num_classes,
        }
    }

    pub fn resnet18(input_channels: usize, input_hw: (usize, usize), num_classes: usize) -> Self {
        Self {
            input_channels,
            input_hw,
            stem_channels: 64,
            stem_kernel: (7, 7),
            stem_stride: (2, 2),
            stem_padding: (3, 3),
            use_max_pool: true,
            stage_channels: vec![64, 128, 256, 512],
            num_classes,
        }
    }

    pub fn resnet_custom(
        input_channels: usize,
        input_hw: (usize, usize),
        num_classes: usize,
    ) -> Self {
        Self {
            stage_channels: vec![32, 64, 128, 128],
            ..Self::resnet18(input_channels, input_hw, num_classes)
        }
    }

    fn validate(&self) -> PureResult<()> {
        if self.stage_channels.is_empty() {
            return Err(TensorError::EmptyInput("resnet_stage_channels"));
        }
        if self.num_classes == 0 {
            return Err(TensorError::InvalidValue {
                label: "resnet_num_classes",
            });
        }
        Ok(())
    }
}

/// Activations captured while rebuilding a block for backward.
struct BlockTrace {
    conv1_out: Tensor,
    bn1_out: Tensor,
    act1_out: Tensor,
    conv2_out: Tensor,
    shortcut_conv_out: Option<Tensor>,
    summed: Tensor,
    out: Tensor,
}

/// conv3x3(stride) -> BN -> ReLU -> conv3x3 -> BN, plus an identity or
/// projected shortcut, then ReLU. Convolutions carry no bias.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    shortcut: Option<(Conv2d, BatchNorm2d)>,
    relu: Relu,
    output_hw: (usize, usize),
}

impl ResidualBlock {
    fn new(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        input_hw: (usize, usize),
        seed: u64,
    ) -> PureResult<Self> {
        let stride = (stride, stride);
        let conv1 = Conv2d::new(
            format!("{name}.conv1"),
            in_channels,
            out_channels,
            (3, 3),
            stride,
            (1, 1),
            input_hw,
            false,
            Some(derive_seed(seed, format!("{name}.conv1"))),
        )?;
        let hidden_hw = conv1.output_hw()?;
        let conv2 = Conv2d::new(
            format!("{name}.conv2"),
            out_channels,
            out_channels,
            (3, 3),
            (1, 1),
            (1, 1),
            hidden_hw,
            false,
            Some(derive_seed(seed, format!("{name}.conv2"))),
        )?;
        let output_hw = conv2.output_hw()?;
        let shortcut = if stride != (1, 1) || in_channels != out_channels {
            let conv = Conv2d::new(
                format!("{name}.shortcut.conv"),
                in_channels,
                out_channels,
                (1, 1),
                stride,
                (0, 0),
                input_hw,
                false,
                Some(derive_seed(seed, format!("{name}.shortcut.conv"))),
            )?;
            let bn = BatchNorm2d::new(format!("{name}.shortcut.bn"), out_channels)?;
            Some((conv, bn))
        } else {
            None
        };
        Ok(Self {
            conv1,
            bn1: BatchNorm2d::new(format!("{name}.bn1"), out_channels)?,
            conv2,
            bn2: BatchNorm2d::new(format!("{name}.bn2"), out_channels)?,
            shortcut,
            relu: Relu::new(),
            output_hw,
        })
    }

    pub fn conv2(&self) -> &Conv2d {
        &self.conv2
    }

    pub fn bn2(&self) -> &BatchNorm2d {
        &self.bn2
    }

    fn trace(&self, input: &Tensor, track: bool) -> PureResult<BlockTrace> {
        let bn = |layer: &BatchNorm2d, x: &Tensor| {
            if track {
                layer.forward(x)
            } else {
                layer.forward_untracked(x)
            }
        };
        let conv1_out = self.conv1.forward(input)?;
        let bn1_out = bn(&self.bn1, &conv1_out)?;
        let act1_out = self.relu.forward(&bn1_out)?;
        let conv2_out = self.conv2.forward(&act1_out)?;
        let main = bn(&self.bn2, &conv2_out)?;
        let (shortcut_conv_out, residual) = match &self.shortcut {
            Some((conv, norm)) => {
                let projected = conv.forward(input)?;
                let residual = bn(norm, &projected)?;
                (Some(projected), residual)
            }
            None => (None, input.clone()),
        };
        let summed = main.add(&residual)?;
        let out = self.relu.forward(&summed)?;
        Ok(BlockTrace {
            conv1_out,
            bn1_out,
            act1_out,
            conv2_out,
            shortcut_conv_out,
            summed,
            out,
        })
    }

    fn reinitialize_xavier(&mut self, seed: u64, name: &str) -> PureResult<()> {
        self.conv1
            .reinitialize_xavier(Some(derive_seed(seed, format!("{name}.conv1"))))?;
        self.conv2
            .reinitialize_xavier(Some(derive_seed(seed, format!("{name}.conv2"))))?;
        if let Some((conv, _)) = self.shortcut.as_mut() {
            conv.reinitialize_xavier(Some(derive_seed(seed, format!("{name}.shortcut.conv"))))?;
        }
        Ok(())
    }

    fn for_each_norm(&self, f: &mut dyn FnMut(&BatchNorm2d)) {
        f(&self.bn1);
        f(&self.bn2);
        if let Some((_, bn)) = &self.shortcut {
            f(bn);
        }
    }
}

impl Module for ResidualBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(self.trace(input, true)?.out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let trace = self.trace(input, false)?;
        let grad_summed = self.relu.backward(&trace.summed, grad_output)?;

        let mut grad = self.bn2.backward(&trace.conv2_out, &grad_summed)?;
        grad = self.conv2.backward(&trace.act1_out, &grad)?;
        grad = self.relu.backward(&trace.bn1_out, &grad)?;
        grad = self.bn1.backward(&trace.conv1_out, &grad)?;
        let grad_input = self.conv1.backward(input, &grad)?;

        let grad_skip = match (&mut self.shortcut, &trace.shortcut_conv_out) {
            (Some((conv, norm)), Some(projected)) => {
                let grad_projected = norm.backward(projected, &grad_summed)?;
                conv.backward(input, &grad_projected)?
            }
            _ => grad_summed,
        };
        grad_input.add(&grad_skip)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters(visitor)?;
        self.bn1.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        self.bn2.visit_parameters(visitor)?;
        if let Some((conv, bn)) = &self.shortcut {
            conv.visit_parameters(visitor)?;
            bn.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters_mut(visitor)?;
        self.bn1.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        self.bn2.visit_parameters_mut(visitor)?;
        if let Some((conv, bn)) = &mut self.shortcut {
            conv.visit_parameters_mut(visitor)?;
            bn.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.bn1.visit_buffers(visitor)?;
        self.bn2.visit_buffers(visitor)?;
        if let Some((_, bn)) = &self.shortcut {
            bn.visit_buffers(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.bn1.visit_buffers_mut(visitor)?;
        self.bn2.visit_buffers_mut(visitor)?;
        if let Some((_, bn)) = &mut self.shortcut {
            bn.visit_buffers_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.for_each_norm(&mut |bn| bn.set_training(training));
    }
}

struct ClassifierTrace {
    stem_conv_out: Tensor,
    stem_bn_out: Tensor,
    stem_act_out: Tensor,
    block_inputs: Vec<Tensor>,
    last_block_out: Tensor,
    features: Tensor,
}

/// Residual feature extractor with global average pooling and a linear head.
///
/// Inputs are `(batch, channels * height * width)`; outputs are logits of
/// shape `(batch, num_classes)`.
#[derive(Debug, Clone)]
pub struct ResNetClassifier {
    config: ResNetConfig,
    stem_conv: Conv2d,
    stem_bn: BatchNorm2d,
    stem_pool: Option<MaxPool2d>,
    relu: Relu,
    blocks: Vec<ResidualBlock>,
    global_pool: AvgPool2d,
    head: Linear,
}

impl ResNetClassifier {
    pub fn new(config: ResNetConfig, seed: u64) -> PureResult<Self> {
        config.validate()?;
        let stem_conv = Conv2d::new(
            "stem.conv",
            config.input_channels,
            config.stem_channels,
            config.stem_kernel,
            config.stem_stride,
            config.stem_padding,
            config.input_hw,
            false,
            Some(derive_seed(seed, "stem.conv")),
        )?;
        let mut hw = stem_conv.output_hw()?;
        let stem_pool = if config.use_max_pool {
            let pool = MaxPool2d::new(config.stem_channels, (3, 3), (2, 2), (1, 1), hw)?;
            hw = pool.output_hw()?;
            Some(pool)
        } else {
            None
        };
        let mut blocks = Vec::with_capacity(config.stage_channels.len());
        let mut in_channels = config.stem_channels;
        for (stage, &out_channels) in config.stage_channels.iter().enumerate() {
            let stride = if stage == 0 { 1 } else { 2 };
            let block = ResidualBlock::new(
                &format!("stage{stage}"),
                in_channels,
                out_channels,
                stride,
                hw,
                seed,
            )?;
            hw = block.output_hw;
            in_channels = out_channels;
            blocks.push(block);
        }
        let global_pool = AvgPool2d::global(in_channels, hw)?;
        let head = Linear::new(
            "fc",
            in_channels,
            config.num_classes,
            Some(derive_seed(seed, "fc")),
        )?;
        Ok(Self {
            stem_bn: BatchNorm2d::new("stem.bn", config.stem_channels)?,
            config,
            stem_conv,
            stem_pool,
            relu: Relu::new(),
            blocks,
            global_pool,
            head,
        })
    }

    pub fn from_preset(
        preset: ResNetPreset,
        input_channels: usize,
        input_hw: (usize, usize),
        num_classes: usize,
        seed: u64,
    ) -> PureResult<Self> {
        Self::new(preset.config(input_channels, input_hw, num_classes), seed)
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    pub fn feature_dim(&self) -> usize {
        self.head.input_dim()
    }

    pub fn stage_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn head(&self) -> &Linear {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut Linear {
        &mut self.head
    }

    pub fn stage(&self, index: usize) -> Option<&ResidualBlock> {
        self.blocks.get(index)
    }

    fn trace(&self, input: &Tensor, track: bool) -> PureResult<ClassifierTrace> {
        let stem_conv_out = self.stem_conv.forward(input)?;
        let stem_bn_out = if track {
            self.stem_bn.forward(&stem_conv_out)?
        } else {
            self.stem_bn.forward_untracked(&stem_conv_out)?
        };
        let stem_act_out = self.relu.forward(&stem_bn_out)?;
        let mut activ = match &self.stem_pool {
            Some(pool) => pool.forward(&stem_act_out)?,
            None => stem_act_out.clone(),
        };
        let mut block_inputs = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let out = block.trace(&activ, track)?.out;
            block_inputs.push(std::mem::replace(&mut activ, out));
        }
        let features = self.global_pool.forward(&activ)?;
        Ok(ClassifierTrace {
            stem_conv_out,
            stem_bn_out,
            stem_act_out,
            block_inputs,
            last_block_out: activ,
            features,
        })
    }

    /// Pooled penultimate features, `(batch, feature_dim)`.
    pub fn extract_features(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(self.trace(input, true)?.features)
    }

    /// Switches every normalisation layer between batch and running statistics.
    pub fn set_training(&self, training: bool) {
        Module::set_training(self, training);
    }

    pub fn is_training(&self) -> bool {
        self.stem_bn.is_training()
    }

    /// Owned deep copy used for frozen teachers.
    pub fn snapshot(&self) -> PureResult<Self> {
        let mut copy = self.clone();
        // Frozen copies never carry pending gradients.
        copy.zero_accumulators()?;
        Ok(copy)
    }

    /// Redraws every convolution and the head from Xavier-uniform; biases are
    /// zeroed and normalisation layers are left as they are.
    pub fn reinitialize_xavier(&mut self, seed: u64) -> PureResult<()> {
        self.stem_conv
            .reinitialize_xavier(Some(derive_seed(seed, "stem.conv")))?;
        for (stage, block) in self.blocks.iter_mut().enumerate() {
            block.reinitialize_xavier(seed, &format!("stage{stage}"))?;
        }
        self.head
            .reinitialize_xavier(Some(derive_seed(seed, "fc")))
    }

    /// Copies the parameter groups named by `layer_indices`.
    pub fn extract(&self, layer_indices: &[usize]) -> PureResult<ExtractedWeights> {
        WeightSchema::build(self, layer_indices)?.extract(self)
    }

    /// Writes parameter groups previously produced by [`Self::extract`] (or a
    /// surgery step) back into the model.
    pub fn inject(
        &mut self,
        distinct: &[Vec<f32>],
        shared: &[f32],
        layer_indices: &[usize],
    ) -> PureResult<()> {
        let schema = WeightSchema::build(self, layer_indices)?;
        schema.inject(self, distinct, shared)
    }

    pub fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> PureResult<()> {
        io::save_json(self, path)
    }

    pub fn load_json<P: AsRef<std::path::Path>>(&mut self, path: P) -> PureResult<()> {
        io::load_json(self, path)
    }

    pub fn save_bincode<P: AsRef<std::path::Path>>(&self, path: P) -> PureResult<()> {
        io::save_bincode(self, path)
    }

    pub fn load_bincode<P: AsRef<std::path::Path>>(&mut self, path: P) -> PureResult<()> {
        io::load_bincode(self, path)
    }
}

impl Module for ResNetClassifier {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let features = self.extract_features(input)?;
        self.head.forward(&features)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let trace = self.trace(input, false)?;
        let mut grad = self.head.backward(&trace.features, grad_output)?;
        grad = self
            .global_pool
            .backward(&trace.last_block_out, &grad)?;
        for (block, block_input) in self
            .blocks
            .iter_mut()
            .rev()
            .zip(trace.block_inputs.iter().rev())
        {
            grad = block.backward(block_input, &grad)?;
        }
        if let Some(pool) = &mut self.stem_pool {
            grad = pool.backward(&trace.stem_act_out, &grad)?;
        }
        grad = self.relu.backward(&trace.stem_bn_out, &grad)?;
        grad = self.stem_bn.backward(&trace.stem_conv_out, &grad)?;
        self.stem_conv.backward(input, &grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_conv.visit_parameters(visitor)?;
        self.stem_bn.visit_parameters(visitor)?;
        for block in &self.blocks {
            block.visit_parameters(visitor)?;
        }
        self.head.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_conv.visit_parameters_mut(visitor)?;
        self.stem_bn.visit_parameters_mut(visitor)?;
        for block in &mut self.blocks {
            block.visit_parameters_mut(visitor)?;
        }
        self.head.visit_parameters_mut(visitor)
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_bn.visit_buffers(visitor)?;
        for block in &self.blocks {
            block.visit_buffers(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_bn.visit_buffers_mut(visitor)?;
        for block in &mut self.blocks {
            block.visit_buffers_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.stem_bn.set_training(training);
        for block in &self.blocks {
            block.set_training(training);
        }
    }
}

impl GroupedBackbone for ResNetClassifier {
    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn head_parameter_names(&self) -> (String, String) {
        (
            self.head.weight().name().to_string(),
            self.head.bias().name().to_string(),
        )
    }

    /// Group `k >= 2` addresses stage `S - (k - 2) - 1`, i.e. `2` is the
    /// deepest stage; each group is that block's `conv2` weight then `bn2`
    /// gamma.
    fn group_parameter_names(&self, index: usize) -> PureResult<Vec<String>> {
        let stages = self.blocks.len();
        if index <= HEAD_GROUP || index > stages + 1 {
            return Err(TensorError::UnknownParameterGroup { index });
        }
        let block = &self.blocks[stages - (index - 2) - 1];
        Ok(vec![
            block.conv2.weight().name().to_string(),
            block.bn2.gamma().name().to_string(),
        ])
    }
}
