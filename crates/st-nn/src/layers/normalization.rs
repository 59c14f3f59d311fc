// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::validate_positive;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};

/// Per-channel batch normalisation over `(batch, channels * spatial)` inputs.
///
/// Statistics are reduced over the batch and spatial axes. In training mode
/// the forward pass folds batch statistics into the running estimates
/// (`momentum` weighting, unbiased variance); evaluation mode normalises with
/// the running estimates only.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    name: String,
    channels: usize,
    gamma: Parameter,
    beta: Parameter,
    epsilon: f32,
    momentum: f32,
    running_mean: RefCell<Tensor>,
    running_var: RefCell<Tensor>,
    training: Cell<bool>,
}

struct BatchStatistics {
    mean: Vec<f32>,
    var: Vec<f32>,
}

impl BatchNorm2d {
    pub fn new(name: impl Into<String>, channels: usize) -> PureResult<Self> {
        Self::with_options(name, channels, 0.1, 1e-5)
    }

    pub fn with_options(
        name: impl Into<String>,
        channels: usize,
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        if !(0.0..=1.0).contains(&momentum) {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_epsilon",
            });
        }
        let name = name.into();
        Ok(Self {
            gamma: Parameter::new(format!("{name}::gamma"), Tensor::full(1, channels, 1.0)?),
            beta: Parameter::new(format!("{name}::beta"), Tensor::zeros(1, channels)?),
            running_mean: RefCell::new(Tensor::zeros(1, channels)?),
            running_var: RefCell::new(Tensor::full(1, channels, 1.0)?),
            training: Cell::new(true),
            name,
            channels,
            epsilon,
            momentum,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn gamma(&self) -> &Parameter {
        &self.gamma
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    pub fn running_mean(&self) -> Tensor {
        self.running_mean.borrow().clone()
    }

    pub fn running_var(&self) -> Tensor {
        self.running_var.borrow().clone()
    }

    fn spatial(&self, input: &Tensor) -> PureResult<usize> {
        let cols = input.shape().1;
        if cols % self.channels != 0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, self.channels),
            });
        }
        Ok(cols / self.channels)
    }

    fn batch_statistics(&self, input: &Tensor, spatial: usize) -> BatchStatistics {
        let (batch, cols) = input.shape();
        let count = (batch * spatial) as f32;
        let data = input.data();
        let mut mean = vec![0.0f32; self.channels];
        let mut var = vec![0.0f32; self.channels];
        for b in 0..batch {
            for (c, m) in mean.iter_mut().enumerate() {
                let start = b * cols + c * spatial;
                *m += data[start..start + spatial].iter().sum::<f32>();
            }
        }
        for m in &mut mean {
            *m /= count;
        }
        for b in 0..batch {
            for (c, v) in var.iter_mut().enumerate() {
                let start = b * cols + c * spatial;
                *v += data[start..start + spatial]
                    .iter()
                    .map(|x| (x - mean[c]) * (x - mean[c]))
                    .sum::<f32>();
            }
        }
        for v in &mut var {
            *v /= count;
        }
        BatchStatistics { mean, var }
    }

    fn fold_running(&self, stats: &BatchStatistics, count: usize) {
        let correction = if count > 1 {
            count as f32 / (count - 1) as f32
        } else {
            1.0
        };
        let m = self.momentum;
        let mut running_mean = self.running_mean.borrow_mut();
        for (r, b) in running_mean.data_mut().iter_mut().zip(stats.mean.iter()) {
            *r = (1.0 - m) * *r + m * b;
        }
        let mut running_var = self.running_var.borrow_mut();
        for (r, b) in running_var.data_mut().iter_mut().zip(stats.var.iter()) {
            *r = (1.0 - m) * *r + m * b * correction;
        }
    }

    fn normalising_statistics(
        &self,
        input: &Tensor,
        spatial: usize,
        fold: bool,
    ) -> (Vec<f32>, Vec<f32>) {
        if self.training.get() {
            let stats = self.batch_statistics(input, spatial);
            if fold {
                self.fold_running(&stats, input.shape().0 * spatial);
            }
            let inv_std = stats
                .var
                .iter()
                .map(|v| 1.0 / (v + self.epsilon).sqrt())
                .collect();
            (stats.mean, inv_std)
        } else {
            let mean = self.running_mean.borrow().data().to_vec();
            let inv_std = self
                .running_var
                .borrow()
                .data()
                .iter()
                .map(|v| 1.0 / (v + self.epsilon).sqrt())
                .collect();
            (mean, inv_std)
        }
    }

    /// Forward pass that leaves the running estimates untouched. Composite
    /// models use it to rebuild activations during backward.
    pub fn forward_untracked(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalise(input, false)
    }

    fn normalise(&self, input: &Tensor, fold: bool) -> PureResult<Tensor> {
        let spatial = self.spatial(input)?;
        let (batch, cols) = input.shape();
        let (mean, inv_std) = self.normalising_statistics(input, spatial, fold);
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let mut output = input.clone();
        let data = output.data_mut();
        for b in 0..batch {
            for c in 0..self.channels {
                let start = b * cols + c * spatial;
                let scale = gamma[c] * inv_std[c];
                let shift = beta[c] - mean[c] * scale;
                for x in &mut data[start..start + spatial] {
                    *x = *x * scale + shift;
                }
            }
        }
        Ok(output)
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalise(input, true)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let spatial = self.spatial(input)?;
        let (batch, cols) = input.shape();
        let count = (batch * spatial) as f32;
        // recompute without touching the running estimates
        let (mean, inv_std) = self.normalising_statistics(input, spatial, false);
        let x = input.data();
        let dy = grad_output.data();

        let mut sum_dy = vec![0.0f32; self.channels];
        let mut sum_dy_xhat = vec![0.0f32; self.channels];
        for b in 0..batch {
            for c in 0..self.channels {
                let start = b * cols + c * spatial;
                for i in start..start + spatial {
                    let x_hat = (x[i] - mean[c]) * inv_std[c];
                    sum_dy[c] += dy[i];
                    sum_dy_xhat[c] += dy[i] * x_hat;
                }
            }
        }

        let gamma = self.gamma.value().data().to_vec();
        let training = self.training.get();
        let mut grad_input = Tensor::zeros(batch, cols)?;
        let dx = grad_input.data_mut();
        for b in 0..batch {
            for c in 0..self.channels {
                let start = b * cols + c * spatial;
                let scale = gamma[c] * inv_std[c];
                for i in start..start + spatial {
                    dx[i] = if training {
                        let x_hat = (x[i] - mean[c]) * inv_std[c];
                        scale / count * (count * dy[i] - sum_dy[c] - x_hat * sum_dy_xhat[c])
                    } else {
                        scale * dy[i]
                    };
                }
            }
        }

        self.gamma
            .accumulate_euclidean(&Tensor::from_vec(1, self.channels, sum_dy_xhat)?)?;
        self.beta
            .accumulate_euclidean(&Tensor::from_vec(1, self.channels, sum_dy)?)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)?;
        Ok(())
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(
            &format!("{}::running_mean", self.name),
            &self.running_mean.borrow(),
        )?;
        visitor(
            &format!("{}::running_var", self.name),
            &self.running_var.borrow(),
        )
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(
            &format!("{}::running_mean", self.name),
            self.running_mean.get_mut(),
        )?;
        visitor(
            &format!("{}::running_var", self.name),
            self.running_var.get_mut(),
        )
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}
