// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! First-order optimisers and learning-rate schedulers.
//!
//! Optimisers walk a module's parameters, consume the accumulated gradients
//! and keep their per-parameter state keyed by the parameter name.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;
use tracing::info;

/// Updates a module in place from its accumulated gradients.
pub trait Optimizer {
    /// Applies one update to every parameter carrying a gradient, then clears
    /// the gradients.
    fn step(&mut self, module: &mut dyn Module) -> PureResult<()>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()>;
}

fn guard_learning_rate(rate: f32) -> PureResult<()> {
    if !(rate > 0.0) || !rate.is_finite() {
        return Err(TensorError::NonPositiveLearningRate { rate });
    }
    Ok(())
}

fn take_gradient(param: &mut Parameter) -> Option<Tensor> {
    let grad = param.gradient().cloned();
    param.zero_gradient();
    grad
}

/// Stochastic gradient descent with heavy-ball momentum and L2 weight decay
/// folded into the gradient.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: HashMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> PureResult<Self> {
        guard_learning_rate(learning_rate)?;
        if !(0.0..1.0).contains(&momentum) {
            return Err(TensorError::InvalidValue {
                label: "sgd_momentum",
            });
        }
        if weight_decay < 0.0 {
            return Err(TensorError::InvalidValue {
                label: "sgd_weight_decay",
            });
        }
        Ok(Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        let (lr, momentum, weight_decay) = (self.learning_rate, self.momentum, self.weight_decay);
        let velocity = &mut self.velocity;
        module.visit_parameters_mut(&mut |param| {
            let Some(grad) = take_gradient(param) else {
                return Ok(());
            };
            let buffer = velocity
                .entry(param.name().to_string())
                .or_insert_with(|| vec![0.0; grad.len()]);
            let values = param.value_mut().data_mut();
            for ((w, g), v) in values.iter_mut().zip(grad.data()).zip(buffer.iter_mut()) {
                let g = g + weight_decay * *w;
                *v = momentum * *v + g;
                *w -= lr * *v;
            }
            Ok(())
        })
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()> {
        guard_learning_rate(learning_rate)?;
        self.learning_rate = learning_rate;
        Ok(())
    }
}

/// Moment estimates for a single parameter tensor.
#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
    step: i32,
}

/// Adam with decoupled weight decay.
#[derive(Debug, Clone)]
pub struct AdamW {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    state: HashMap<String, Moments>,
}

impl AdamW {
    /// Standard betas `(0.9, 0.999)`, `eps = 1e-8`, weight decay `0.01`.
    pub fn new(learning_rate: f32) -> PureResult<Self> {
        Self::with_options(learning_rate, (0.9, 0.999), 1e-8, 0.01)
    }

    pub fn with_options(
        learning_rate: f32,
        betas: (f32, f32),
        epsilon: f32,
        weight_decay: f32,
    ) -> PureResult<Self> {
        guard_learning_rate(learning_rate)?;
        if !(0.0..1.0).contains(&betas.0) || !(0.0..1.0).contains(&betas.1) {
            return Err(TensorError::InvalidValue {
                label: "adamw_betas",
            });
        }
        Ok(Self {
            learning_rate,
            beta1: betas.0,
            beta2: betas.1,
            epsilon,
            weight_decay,
            state: HashMap::new(),
        })
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        let (lr, beta1, beta2, eps, wd) = (
            self.learning_rate,
            self.beta1,
            self.beta2,
            self.epsilon,
            self.weight_decay,
        );
        let state = &mut self.state;
        module.visit_parameters_mut(&mut |param| {
            let Some(grad) = take_gradient(param) else {
                return Ok(());
            };
            let moments = state
                .entry(param.name().to_string())
                .or_insert_with(|| Moments {
                    m: vec![0.0; grad.len()],
                    v: vec![0.0; grad.len()],
                    step: 0,
                });
            moments.step += 1;
            let bc1_inv = 1.0 / (1.0 - beta1.powi(moments.step));
            let bc2_inv = 1.0 / (1.0 - beta2.powi(moments.step));
            let values = param.value_mut().data_mut();
            for (i, w) in values.iter_mut().enumerate() {
                let g = grad.data()[i];
                moments.m[i] = beta1 * moments.m[i] + (1.0 - beta1) * g;
                moments.v[i] = beta2 * moments.v[i] + (1.0 - beta2) * g * g;
                let m_hat = moments.m[i] * bc1_inv;
                let v_hat = moments.v[i] * bc2_inv;
                *w -= lr * (m_hat / (v_hat.sqrt() + eps) + wd * *w);
            }
            Ok(())
        })
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()> {
        guard_learning_rate(learning_rate)?;
        self.learning_rate = learning_rate;
        Ok(())
    }
}

/// Adjusts an optimiser's learning rate from an observed metric.
pub trait LrScheduler {
    /// Feeds the latest metric. Returns the learning rate in effect afterwards.
    fn step(&mut self, metric: f32, optimizer: &mut dyn Optimizer) -> PureResult<f32>;
}

/// Multiplies the learning rate by `factor` once the monitored loss has not
/// improved (relative threshold) for more than `patience` consecutive steps.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f32,
    patience: usize,
    threshold: f32,
    min_lr: f32,
    best: f32,
    bad_steps: usize,
}

impl Default for ReduceLrOnPlateau {
    fn default() -> Self {
        Self {
            factor: 0.1,
            patience: 10,
            threshold: 1e-4,
            min_lr: 0.0,
            best: f32::INFINITY,
            bad_steps: 0,
        }
    }
}

impl ReduceLrOnPlateau {
    pub fn new(patience: usize, factor: f32) -> PureResult<Self> {
        if !(factor > 0.0 && factor < 1.0) {
            return Err(TensorError::InvalidValue {
                label: "plateau_factor",
            });
        }
        Ok(Self {
            factor,
            patience,
            ..Self::default()
        })
    }

    pub fn best(&self) -> f32 {
        self.best
    }
}

impl LrScheduler for ReduceLrOnPlateau {
    fn step(&mut self, metric: f32, optimizer: &mut dyn Optimizer) -> PureResult<f32> {
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.bad_steps = 0;
        } else {
            self.bad_steps += 1;
        }
        if self.bad_steps > self.patience {
            let current = optimizer.learning_rate();
            let reduced = (current * self.factor).max(self.min_lr);
            if reduced > 0.0 && reduced < current {
                optimizer.set_learning_rate(reduced)?;
                info!(from = current, to = reduced, "plateau reached, reducing learning rate");
            }
            self.bad_steps = 0;
        }
        Ok(optimizer.learning_rate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use approx::assert_abs_diff_eq;

    fn layer_with_unit_gradient() -> Linear {
        let mut layer = Linear::new("fc", 1, 1, Some(3)).unwrap();
        layer
            .weight_mut()
            .load_value(&Tensor::from_vec(1, 1, vec![1.0]).unwrap())
            .unwrap();
        layer
            .weight_mut()
            .accumulate_euclidean(&Tensor::from_vec(1, 1, vec![1.0]).unwrap())
            .unwrap();
        layer
    }

    #[test]
    fn sgd_momentum_accumulates_velocity() {
        let mut layer = layer_with_unit_gradient();
        let mut sgd = Sgd::new(0.1, 0.9, 0.0).unwrap();
        sgd.step(&mut layer).unwrap();
        assert_abs_diff_eq!(layer.weight().value().data()[0], 0.9, epsilon = 1e-6);
        assert!(layer.weight().gradient().is_none());
        layer
            .weight_mut()
            .accumulate_euclidean(&Tensor::from_vec(1, 1, vec![1.0]).unwrap())
            .unwrap();
        sgd.step(&mut layer).unwrap();
        // velocity = 0.9 * 1 + 1 = 1.9
        assert_abs_diff_eq!(layer.weight().value().data()[0], 0.9 - 0.19, epsilon = 1e-6);
    }

    #[test]
    fn adamw_first_step_moves_by_learning_rate() {
        let mut layer = layer_with_unit_gradient();
        let mut adam = AdamW::with_options(0.01, (0.9, 0.999), 1e-8, 0.0).unwrap();
        adam.step(&mut layer).unwrap();
        assert_abs_diff_eq!(layer.weight().value().data()[0], 0.99, epsilon = 1e-5);
    }

    #[test]
    fn plateau_reduces_after_patience() {
        let mut sgd = Sgd::new(1.0, 0.0, 0.0).unwrap();
        let mut plateau = ReduceLrOnPlateau::new(1, 0.5).unwrap();
        assert_eq!(plateau.step(1.0, &mut sgd).unwrap(), 1.0);
        assert_eq!(plateau.step(1.0, &mut sgd).unwrap(), 1.0);
        assert_eq!(plateau.step(1.0, &mut sgd).unwrap(), 0.5);
        assert_eq!(plateau.step(0.1, &mut sgd).unwrap(), 0.5);
    }

    #[test]
    fn rejects_non_positive_learning_rate() {
        assert!(matches!(
            Sgd::new(0.0, 0.9, 0.0),
            Err(TensorError::NonPositiveLearningRate { .. })
        ));
    }
}
