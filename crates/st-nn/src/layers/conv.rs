// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Spatial layers operating on `(batch, channels * height * width)` tensors.
//!
//! Every spatial tensor is laid out channel-major: element `(c, y, x)` of a
//! sample lives at column `c * h * w + y * w + x`.

use super::{guard_columns, validate_positive, xavier_uniform};
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::RefCell;

fn pooled_extent(
    input_hw: (usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PureResult<(usize, usize)> {
    let (h, w) = input_hw;
    let (kh, kw) = kernel;
    let (ph, pw) = padding;
    if h + 2 * ph < kh || w + 2 * pw < kw {
        return Err(TensorError::InvalidDimensions {
            rows: h + 2 * ph,
            cols: kh.max(kw),
        });
    }
    Ok(((h + 2 * ph - kh) / stride.0 + 1, (w + 2 * pw - kw) / stride.1 + 1))
}

/// 2-D convolution lowered onto a matmul through im2col.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    /// Creates a convolution with Xavier-uniform weights. The weight is stored
    /// as `(out_channels, in_channels * kh * kw)`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
        with_bias: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let receptive = kernel.0 * kernel.1;
        let weight = xavier_uniform(out_channels, span, span, out_channels * receptive, seed)?;
        let bias = if with_bias {
            Some(Parameter::new(
                format!("{name}::bias"),
                Tensor::zeros(1, out_channels)?,
            ))
        } else {
            None
        };
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias,
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        conv.output_hw()?;
        Ok(conv)
    }

    /// Spatial extent of the produced feature map.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        pooled_extent(self.input_hw, self.kernel, self.stride, self.padding)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Parameter {
        &mut self.weight
    }

    /// Redraws the kernel from Xavier-uniform and clears the bias.
    pub fn reinitialize_xavier(&mut self, seed: Option<u64>) -> PureResult<()> {
        let span = self.in_channels * self.kernel.0 * self.kernel.1;
        let receptive = self.kernel.0 * self.kernel.1;
        let weight = xavier_uniform(
            self.out_channels,
            span,
            span,
            self.out_channels * receptive,
            seed,
        )?;
        self.weight.load_value(&weight)?;
        self.weight.zero_gradient();
        if let Some(bias) = self.bias.as_mut() {
            bias.load_value(&Tensor::zeros(1, self.out_channels)?)?;
            bias.zero_gradient();
        }
        Ok(())
    }

    fn expected_cols(&self) -> usize {
        self.in_channels * self.input_hw.0 * self.input_hw.1
    }

    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, kernel_elems)?;
        let cols = input.shape().1;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let input_data = input.data();
        let column_data = columns.data_mut();
        for b in 0..batch {
            let row = &input_data[b * cols..(b + 1) * cols];
            for oy in 0..oh {
                for ox in 0..ow {
                    let offset = (b * oh * ow + oy * ow + ox) * kernel_elems;
                    let mut col_idx = 0;
                    for ic in 0..self.in_channels {
                        let channel_offset = ic * h * w;
                        for ky in 0..self.kernel.0 {
                            for kx in 0..self.kernel.1 {
                                let iy = (oy * self.stride.0 + ky) as isize - pad_h;
                                let ix = (ox * self.stride.1 + kx) as isize - pad_w;
                                if iy >= 0 && ix >= 0 && iy < h as isize && ix < w as isize {
                                    column_data[offset + col_idx] =
                                        row[channel_offset + iy as usize * w + ix as usize];
                                }
                                col_idx += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, patches: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut output = Tensor::zeros(batch, self.expected_cols())?;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let output_cols = output.shape().1;
        let patch_data = patches.data();
        let output_data = output.data_mut();
        for b in 0..batch {
            let grad_row = &mut output_data[b * output_cols..(b + 1) * output_cols];
            for oy in 0..oh {
                for ox in 0..ow {
                    let row_index = b * oh * ow + oy * ow + ox;
                    let patch =
                        &patch_data[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                    let mut col_idx = 0;
                    for ic in 0..self.in_channels {
                        let channel_offset = ic * h * w;
                        for ky in 0..self.kernel.0 {
                            for kx in 0..self.kernel.1 {
                                let iy = (oy * self.stride.0 + ky) as isize - pad_h;
                                let ix = (ox * self.stride.1 + kx) as isize - pad_w;
                                if iy >= 0 && ix >= 0 && iy < h as isize && ix < w as isize {
                                    grad_row[channel_offset + iy as usize * w + ix as usize] +=
                                        patch[col_idx];
                                }
                                col_idx += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    /// `(batch * oh * ow, out)` patch-major matrix into channel-major rows.
    fn to_channel_major(&self, matrix: &Tensor, batch: usize, spatial: usize) -> PureResult<Tensor> {
        let out = self.out_channels;
        let mut output = Tensor::zeros(batch, out * spatial)?;
        let src = matrix.data();
        let dst = output.data_mut();
        for b in 0..batch {
            for pos in 0..spatial {
                let row = (b * spatial + pos) * out;
                for oc in 0..out {
                    dst[b * out * spatial + oc * spatial + pos] = src[row + oc];
                }
            }
        }
        Ok(output)
    }

    fn grad_output_to_matrix(
        &self,
        grad_output: &Tensor,
        batch: usize,
        spatial: usize,
    ) -> PureResult<Tensor> {
        let out = self.out_channels;
        let mut matrix = Tensor::zeros(batch * spatial, out)?;
        let src = grad_output.data();
        let dst = matrix.data_mut();
        for b in 0..batch {
            for pos in 0..spatial {
                let row = (b * spatial + pos) * out;
                for oc in 0..out {
                    dst[row + oc] = src[b * out * spatial + oc * spatial + pos];
                }
            }
        }
        Ok(matrix)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        guard_columns(input, self.expected_cols())?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let patches = self.im2col(input, batch, oh, ow)?;
        let mut matrix = patches.matmul(&self.weight.value().transpose())?;
        if let Some(bias) = self.bias.as_ref() {
            matrix.add_row_inplace(bias.value().data())?;
        }
        self.to_channel_major(&matrix, batch, oh * ow)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        guard_columns(input, self.expected_cols())?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        if grad_output.shape() != (batch, self.out_channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * oh * ow),
            });
        }
        let patches = self.im2col(input, batch, oh, ow)?;
        let grad_matrix = self.grad_output_to_matrix(grad_output, batch, oh * ow)?;
        let grad_weight = grad_matrix.transpose().matmul(&patches)?;
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        if let Some(bias) = self.bias.as_mut() {
            let sums = grad_matrix.sum_axis0();
            bias.accumulate_euclidean(&Tensor::from_vec(1, sums.len(), sums)?)?;
        }
        self.col2im(&grad_patches, batch, oh, ow)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = self.bias.as_ref() {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        Ok(())
    }
}

/// Max pooling with implicit `-inf` padding.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
    last_indices: RefCell<Vec<usize>>,
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let pool = Self {
            channels,
            kernel,
            stride,
            padding,
            input_hw,
            last_indices: RefCell::new(Vec::new()),
        };
        pool.output_hw()?;
        Ok(pool)
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        pooled_extent(self.input_hw, self.kernel, self.stride, self.padding)
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        guard_columns(input, self.channels * h * w)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let in_cols = self.channels * h * w;
        let out_cols = self.channels * oh * ow;
        let mut output = Tensor::zeros(batch, out_cols)?;
        let mut indices = vec![0usize; batch * out_cols];
        let src = input.data();
        let dst = output.data_mut();
        for b in 0..batch {
            let row = &src[b * in_cols..(b + 1) * in_cols];
            for c in 0..self.channels {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = c * h * w;
                        for ky in 0..self.kernel.0 {
                            for kx in 0..self.kernel.1 {
                                let iy = (oy * self.stride.0 + ky) as isize - self.padding.0 as isize;
                                let ix = (ox * self.stride.1 + kx) as isize - self.padding.1 as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                    continue;
                                }
                                let idx = c * h * w + iy as usize * w + ix as usize;
                                if row[idx] > best {
                                    best = row[idx];
                                    best_idx = idx;
                                }
                            }
                        }
                        let out_idx = c * oh * ow + oy * ow + ox;
                        dst[b * out_cols + out_idx] = best;
                        indices[b * out_cols + out_idx] = best_idx;
                    }
                }
            }
        }
        *self.last_indices.borrow_mut() = indices;
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let output = self.forward(input)?;
        if grad_output.shape() != output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: output.shape(),
            });
        }
        let (batch, in_cols) = input.shape();
        let out_cols = output.shape().1;
        let mut grad_input = Tensor::zeros(batch, in_cols)?;
        let indices = self.last_indices.borrow();
        let grad = grad_output.data();
        let dst = grad_input.data_mut();
        for b in 0..batch {
            for o in 0..out_cols {
                dst[b * in_cols + indices[b * out_cols + o]] += grad[b * out_cols + o];
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

/// Average pooling without padding. A kernel equal to the input extent gives
/// global average pooling.
#[derive(Debug, Clone)]
pub struct AvgPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    input_hw: (usize, usize),
}

impl AvgPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        let pool = Self {
            channels,
            kernel,
            stride,
            input_hw,
        };
        pool.output_hw()?;
        Ok(pool)
    }

    /// Pools the whole feature map of each channel into one value.
    pub fn global(channels: usize, input_hw: (usize, usize)) -> PureResult<Self> {
        Self::new(channels, input_hw, input_hw, input_hw)
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        pooled_extent(self.input_hw, self.kernel, self.stride, (0, 0))
    }

    fn window_sources(&self, c: usize, oy: usize, ox: usize) -> impl Iterator<Item = usize> + '_ {
        let (h, w) = self.input_hw;
        let base_y = oy * self.stride.0;
        let base_x = ox * self.stride.1;
        (0..self.kernel.0).flat_map(move |ky| {
            (0..self.kernel.1).map(move |kx| c * h * w + (base_y + ky) * w + base_x + kx)
        })
    }
}

impl Module for AvgPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        let in_cols = self.channels * h * w;
        guard_columns(input, in_cols)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let out_cols = self.channels * oh * ow;
        let norm = 1.0 / (self.kernel.0 * self.kernel.1) as f32;
        let mut output = Tensor::zeros(batch, out_cols)?;
        let src = input.data();
        let dst = output.data_mut();
        for b in 0..batch {
            let row = &src[b * in_cols..(b + 1) * in_cols];
            for c in 0..self.channels {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let sum: f32 = self.window_sources(c, oy, ox).map(|i| row[i]).sum();
                        dst[b * out_cols + c * oh * ow + oy * ow + ox] = sum * norm;
                    }
                }
            }
        }
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        let in_cols = self.channels * h * w;
        guard_columns(input, in_cols)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let out_cols = self.channels * oh * ow;
        if grad_output.shape() != (batch, out_cols) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, out_cols),
            });
        }
        let norm = 1.0 / (self.kernel.0 * self.kernel.1) as f32;
        let mut grad_input = Tensor::zeros(batch, in_cols)?;
        let grad = grad_output.data();
        let dst = grad_input.data_mut();
        for b in 0..batch {
            for c in 0..self.channels {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let g = grad[b * out_cols + c * oh * ow + oy * ow + ox] * norm;
                        for i in self.window_sources(c, oy, ox) {
                            dst[b * in_cols + i] += g;
                        }
                    }
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn conv_identity_kernel_copies_input() {
        let mut conv = Conv2d::new("c", 1, 1, (1, 1), (1, 1), (0, 0), (2, 2), false, Some(1))
            .unwrap();
        conv.weight_mut()
            .load_value(&Tensor::from_vec(1, 1, vec![1.0]).unwrap())
            .unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(conv.forward(&input).unwrap(), input);
    }

    #[test]
    fn conv_output_is_channel_major() {
        let mut conv = Conv2d::new("c", 1, 2, (1, 1), (1, 1), (0, 0), (1, 2), false, Some(1))
            .unwrap();
        conv.weight_mut()
            .load_value(&Tensor::from_vec(2, 1, vec![1.0, -1.0]).unwrap())
            .unwrap();
        let input = Tensor::from_vec(1, 2, vec![3.0, 5.0]).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.data(), &[3.0, 5.0, -3.0, -5.0]);
    }

    #[test]
    fn conv_padding_preserves_extent() {
        let conv =
            Conv2d::new("c", 2, 3, (3, 3), (1, 1), (1, 1), (4, 4), false, Some(2)).unwrap();
        assert_eq!(conv.output_hw().unwrap(), (4, 4));
        let strided =
            Conv2d::new("s", 2, 3, (3, 3), (2, 2), (1, 1), (4, 4), false, Some(2)).unwrap();
        assert_eq!(strided.output_hw().unwrap(), (2, 2));
    }

    #[test]
    fn conv_input_gradient_matches_finite_difference() {
        let mut conv =
            Conv2d::new("c", 1, 2, (3, 3), (1, 1), (1, 1), (3, 3), true, Some(3)).unwrap();
        let input = Tensor::random_normal(1, 9, 0.0, 1.0, Some(4)).unwrap();
        let ones = Tensor::full(1, 18, 1.0).unwrap();
        let grad = conv.backward(&input, &ones).unwrap();
        let base: f32 = conv.forward(&input).unwrap().data().iter().sum();
        let eps = 1e-2;
        let mut bumped = input.clone();
        bumped.data_mut()[4] += eps;
        let shifted: f32 = conv.forward(&bumped).unwrap().data().iter().sum();
        assert_abs_diff_eq!((shifted - base) / eps, grad.data()[4], epsilon = 1e-2);
    }

    #[test]
    fn max_pool_routes_gradient_to_argmax() {
        let mut pool = MaxPool2d::new(1, (2, 2), (2, 2), (0, 0), (2, 2)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 4.0, 2.0, 3.0]).unwrap();
        assert_eq!(pool.forward(&input).unwrap().data(), &[4.0]);
        let grad = pool
            .backward(&input, &Tensor::from_vec(1, 1, vec![2.0]).unwrap())
            .unwrap();
        assert_eq!(grad.data(), &[0.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn global_average_pool_spreads_gradient() {
        let mut pool = AvgPool2d::global(2, (1, 2)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 3.0, 5.0, 7.0]).unwrap();
        assert_eq!(pool.forward(&input).unwrap().data(), &[2.0, 6.0]);
        let grad = pool
            .backward(&input, &Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap())
            .unwrap();
        assert_eq!(grad.data(), &[0.5, 0.5, 1.0, 1.0]);
    }
}
