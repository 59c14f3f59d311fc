// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust 2-D tensor primitives.
//!
//! Everything is row-major `f32` stored behind a reference-counted buffer, so
//! clones are cheap and writes copy on demand. Image batches are carried as
//! `(batch, channels * height * width)` matrices; the layers in `st-nn`
//! interpret the column axis.

use core::fmt;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use spiral_config::determinism;
use std::error::Error;
use std::sync::Arc;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities and the modules built on top of them.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Softmax temperature must stay positive.
    NonPositiveTemperature { temperature: f32 },
    /// Learning rate must be positive for optimisers.
    NonPositiveLearningRate { rate: f32 },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// A row or class index fell outside the tensor.
    IndexOutOfBounds { index: usize, len: usize },
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// A parameter-group index has no mapping in the addressed backbone.
    UnknownParameterGroup { index: usize },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when (de)serialising tensors.
    SerializationError { message: String },
    /// Numeric guard detected a non-finite value.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::NonPositiveTemperature { temperature } => {
                write!(f, "softmax temperature must be positive, got {temperature}")
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds for length {len}")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
            TensorError::UnknownParameterGroup { index } => {
                write!(f, "unknown layer: {index}")
            }
            TensorError::IoError { message } => {
                write!(f, "i/o error while handling tensor data: {message}")
            }
            TensorError::SerializationError { message } => {
                write!(
                    f,
                    "serialization error while handling tensor data: {message}"
                )
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value detected for {label}: {value}")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
        }
    }
}

impl Error for TensorError {}

/// A simple 2D tensor backed by a reference-counted row-major buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    fn from_parts(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data: Arc::new(data),
            rows,
            cols,
        })
    }

    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    fn guard_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::from_parts(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor filled with `value`.
    pub fn full(rows: usize, cols: usize, value: f32) -> PureResult<Self> {
        Self::from_parts(rows, cols, vec![value; rows * cols])
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// reproducible. Otherwise the process determinism settings decide.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = Self::seedable_rng(seed, "st-tensor/tensor/uniform");
        let distribution = Uniform::new(min, max);
        let data = (0..rows * cols)
            .map(|_| distribution.sample(&mut rng))
            .collect();
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = Self::seedable_rng(seed, "st-tensor/tensor/normal");
        let data = (0..rows * cols)
            .map(|_| {
                let sample: f64 = StandardNormal.sample(&mut rng);
                mean + std * sample as f32
            })
            .collect();
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::from_parts(rows, cols, data)
    }

    /// Builds a `(labels.len(), classes)` one-hot matrix.
    pub fn one_hot(labels: &[usize], classes: usize) -> PureResult<Self> {
        if labels.is_empty() {
            return Err(TensorError::EmptyInput("one_hot_labels"));
        }
        let mut data = vec![0.0; labels.len() * classes];
        for (row, &label) in labels.iter().enumerate() {
            if label >= classes {
                return Err(TensorError::IndexOutOfBounds {
                    index: label,
                    len: classes,
                });
            }
            data[row * classes + label] = 1.0;
        }
        Self::from_parts(labels.len(), classes, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Tensors cannot be empty; kept for API symmetry with `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[f32] {
        self.data.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Borrow a single row.
    pub fn row(&self, row: usize) -> PureResult<&[f32]> {
        if row >= self.rows {
            return Err(TensorError::IndexOutOfBounds {
                index: row,
                len: self.rows,
            });
        }
        Ok(&self.data[row * self.cols..(row + 1) * self.cols])
    }

    /// Copies a single column.
    pub fn column(&self, col: usize) -> PureResult<Vec<f32>> {
        if col >= self.cols {
            return Err(TensorError::IndexOutOfBounds {
                index: col,
                len: self.cols,
            });
        }
        Ok((0..self.rows)
            .map(|r| self.data[r * self.cols + col])
            .collect())
    }

    /// Overwrites a single column.
    pub fn set_column(&mut self, col: usize, values: &[f32]) -> PureResult<()> {
        if col >= self.cols {
            return Err(TensorError::IndexOutOfBounds {
                index: col,
                len: self.cols,
            });
        }
        if values.len() != self.rows {
            return Err(TensorError::DataLength {
                expected: self.rows,
                got: values.len(),
            });
        }
        let cols = self.cols;
        let data = self.data_mut();
        for (r, value) in values.iter().enumerate() {
            data[r * cols + col] = *value;
        }
        Ok(())
    }

    /// Gathers the requested rows (in order) into a new tensor.
    pub fn select_rows(&self, rows: &[usize]) -> PureResult<Tensor> {
        if rows.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::select_rows"));
        }
        let mut data = Vec::with_capacity(rows.len() * self.cols);
        for &row in rows {
            data.extend_from_slice(self.row(row)?);
        }
        Self::from_parts(rows.len(), self.cols, data)
    }

    /// Matrix multiply (`self @ other`).
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.cols);
        let lhs = self.data();
        let rhs = other.data();
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let out_row = &mut out[r * cols..(r + 1) * cols];
            for k in 0..inner {
                let a = lhs[r * inner + k];
                if a == 0.0 {
                    continue;
                }
                let rhs_row = &rhs[k * cols..(k + 1) * cols];
                for (o, b) in out_row.iter_mut().zip(rhs_row.iter()) {
                    *o += a * b;
                }
            }
        }
        Self::from_parts(rows, cols, out)
    }

    /// Element-wise addition.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.guard_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Self::from_parts(self.rows, self.cols, data)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.guard_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Self::from_parts(self.rows, self.cols, data)
    }

    /// Returns a new tensor where every element is scaled by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|a| a * value).collect();
        Self::from_parts(self.rows, self.cols, data)
    }

    /// Element-wise product (Hadamard) between two tensors of identical shape.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.guard_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .collect();
        Self::from_parts(self.rows, self.cols, data)
    }

    /// Add a scaled tensor to this tensor (`self += scale * other`).
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        self.guard_same_shape(other)?;
        let data = Arc::make_mut(&mut self.data);
        for (a, b) in data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Add the provided row vector to every row (`self[row] += bias`).
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        let cols = self.cols;
        let data = Arc::make_mut(&mut self.data);
        for row in data.chunks_mut(cols) {
            for (value, b) in row.iter_mut().zip(bias.iter()) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data: Arc::new(data),
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Returns the sum over rows for each column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row.iter()) {
                *sum += value;
            }
        }
        sums
    }

    /// Mean of every element.
    pub fn mean(&self) -> f32 {
        self.data.iter().sum::<f32>() / self.len() as f32
    }

    /// Concatenates tensors row-wise.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        if tensors.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::cat_rows"));
        }
        let cols = tensors[0].cols;
        let mut total_rows = 0usize;
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (tensor.rows, cols),
                });
            }
            total_rows += tensor.rows;
        }
        let mut data = Vec::with_capacity(total_rows * cols);
        for tensor in tensors {
            data.extend_from_slice(tensor.data());
        }
        Self::from_parts(total_rows, cols, data)
    }

    /// Concatenates tensors column-wise; every input must share the row count.
    pub fn cat_cols(tensors: &[Tensor]) -> PureResult<Tensor> {
        if tensors.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::cat_cols"));
        }
        let rows = tensors[0].rows;
        let mut total_cols = 0usize;
        for tensor in tensors {
            if tensor.rows != rows {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (rows, tensor.cols),
                });
            }
            total_cols += tensor.cols;
        }
        let mut data = Vec::with_capacity(rows * total_cols);
        for r in 0..rows {
            for tensor in tensors {
                data.extend_from_slice(&tensor.data[r * tensor.cols..(r + 1) * tensor.cols]);
            }
        }
        Self::from_parts(rows, total_cols, data)
    }

    /// Computes the squared L2 norm of the tensor.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Row-wise softmax of `self / temperature`.
    pub fn row_softmax_with_temperature(&self, temperature: f32) -> PureResult<Tensor> {
        guard_temperature(temperature)?;
        let mut data = Vec::with_capacity(self.len());
        for row in self.data.chunks(self.cols) {
            let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v / temperature));
            let start = data.len();
            let mut total = 0.0f32;
            for &value in row {
                let e = (value / temperature - max).exp();
                total += e;
                data.push(e);
            }
            for value in &mut data[start..] {
                *value /= total;
            }
        }
        Self::from_parts(self.rows, self.cols, data)
    }

    /// Row-wise softmax at unit temperature.
    pub fn row_softmax(&self) -> PureResult<Tensor> {
        self.row_softmax_with_temperature(1.0)
    }

    /// Row-wise log-softmax of `self / temperature`.
    pub fn row_log_softmax_with_temperature(&self, temperature: f32) -> PureResult<Tensor> {
        guard_temperature(temperature)?;
        let mut data = Vec::with_capacity(self.len());
        for row in self.data.chunks(self.cols) {
            let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v / temperature));
            let log_total = row
                .iter()
                .map(|&v| (v / temperature - max).exp())
                .sum::<f32>()
                .ln();
            data.extend(row.iter().map(|&v| v / temperature - max - log_total));
        }
        Self::from_parts(self.rows, self.cols, data)
    }

    /// Index of the maximum of every row. Ties resolve to the first index.
    pub fn argmax_rows(&self) -> Vec<usize> {
        self.data
            .chunks(self.cols)
            .map(|row| {
                let mut best = 0usize;
                for (idx, value) in row.iter().enumerate() {
                    if *value > row[best] {
                        best = idx;
                    }
                }
                best
            })
            .collect()
    }
}

fn guard_temperature(temperature: f32) -> PureResult<()> {
    if !(temperature > 0.0) || !temperature.is_finite() {
        return Err(TensorError::NonPositiveTemperature { temperature });
    }
    Ok(())
}

/// Mean squared error between two tensors of identical shape.
pub fn mean_squared_error(predictions: &Tensor, targets: &Tensor) -> PureResult<f32> {
    predictions.guard_same_shape(targets)?;
    let sum: f32 = predictions
        .data()
        .iter()
        .zip(targets.data().iter())
        .map(|(p, t)| (p - t) * (p - t))
        .sum();
    Ok(sum / predictions.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn matmul_matches_manual() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn rejects_zero_sized_tensors() {
        assert_eq!(
            Tensor::zeros(0, 3).unwrap_err(),
            TensorError::InvalidDimensions { rows: 0, cols: 3 }
        );
    }

    #[test]
    fn softmax_rows_sum_to_one_and_respect_temperature() {
        let logits = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, -1.0, 0.0, 4.0]).unwrap();
        let cold = logits.row_softmax().unwrap();
        let hot = logits.row_softmax_with_temperature(4.0).unwrap();
        for row in 0..2 {
            assert_abs_diff_eq!(cold.row(row).unwrap().iter().sum::<f32>(), 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(hot.row(row).unwrap().iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        }
        // higher temperature flattens the distribution
        assert!(hot.data()[2] < cold.data()[2]);
        let log = logits.row_log_softmax_with_temperature(4.0).unwrap();
        for (l, p) in log.data().iter().zip(hot.data().iter()) {
            assert_abs_diff_eq!(l.exp(), *p, epsilon = 1e-6);
        }
        assert!(logits.row_softmax_with_temperature(0.0).is_err());
    }

    #[test]
    fn argmax_and_one_hot_agree() {
        let labels = [2usize, 0, 1];
        let one_hot = Tensor::one_hot(&labels, 3).unwrap();
        assert_eq!(one_hot.argmax_rows(), labels.to_vec());
        assert!(Tensor::one_hot(&[3], 3).is_err());
    }

    #[test]
    fn columns_round_trip() {
        let mut t = Tensor::from_fn(3, 2, |r, c| (r * 2 + c) as f32).unwrap();
        assert_eq!(t.column(1).unwrap(), vec![1.0, 3.0, 5.0]);
        t.set_column(0, &[9.0, 8.0, 7.0]).unwrap();
        assert_eq!(t.data(), &[9.0, 1.0, 8.0, 3.0, 7.0, 5.0]);
    }

    #[test]
    fn select_and_concat_rows() {
        let t = Tensor::from_fn(4, 2, |r, _| r as f32).unwrap();
        let picked = t.select_rows(&[3, 1]).unwrap();
        assert_eq!(picked.data(), &[3.0, 3.0, 1.0, 1.0]);
        let stacked = Tensor::cat_rows(&[picked.clone(), picked]).unwrap();
        assert_eq!(stacked.shape(), (4, 2));
        let wide = Tensor::cat_cols(&[t.clone(), t]).unwrap();
        assert_eq!(wide.shape(), (4, 4));
        assert_eq!(wide.row(2).unwrap(), &[2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn seeded_random_is_reproducible() {
        let a = Tensor::random_uniform(3, 3, -1.0, 1.0, Some(5)).unwrap();
        let b = Tensor::random_uniform(3, 3, -1.0, 1.0, Some(5)).unwrap();
        assert_eq!(a, b);
        assert!(a.data().iter().all(|v| (-1.0..1.0).contains(v)));
    }
}
