// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Checkpoint and tensor persistence in JSON or bincode.
//!
//! Module checkpoints store every entry of [`Module::state_dict`], running
//! statistics included, so a reload reproduces evaluation outputs exactly.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

/// Ordered so that JSON checkpoints diff cleanly.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: BTreeMap<String, StoredTensor>,
}

fn to_snapshot<M: Module + ?Sized>(module: &M) -> PureResult<ModuleSnapshot> {
    let parameters = module
        .state_dict()?
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect();
    Ok(ModuleSnapshot { parameters })
}

fn restore<M: Module + ?Sized>(module: &mut M, snapshot: ModuleSnapshot) -> PureResult<()> {
    let mut state = std::collections::HashMap::with_capacity(snapshot.parameters.len());
    for (name, tensor) in snapshot.parameters {
        state.insert(name, tensor.into_tensor()?);
    }
    module.load_state_dict(&state)
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

fn create(path: &Path) -> PureResult<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
    }
    File::create(path).map(BufWriter::new).map_err(io_error)
}

fn open(path: &Path) -> PureResult<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(io_error)
}

pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = to_snapshot(module)?;
    serde_json::to_writer_pretty(create(path.as_ref())?, &snapshot).map_err(serde_error)
}

pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let snapshot: ModuleSnapshot =
        serde_json::from_reader(open(path.as_ref())?).map_err(serde_error)?;
    restore(module, snapshot)
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = to_snapshot(module)?;
    bincode::serialize_into(create(path.as_ref())?, &snapshot).map_err(serde_error)
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let snapshot: ModuleSnapshot =
        bincode::deserialize_from(open(path.as_ref())?).map_err(serde_error)?;
    restore(module, snapshot)
}

/// Persists a bare tensor (features, labels) in bincode.
pub fn save_tensor_bincode<P: AsRef<Path>>(tensor: &Tensor, path: P) -> PureResult<()> {
    bincode::serialize_into(create(path.as_ref())?, &StoredTensor::from_tensor(tensor))
        .map_err(serde_error)
}

pub fn load_tensor_bincode<P: AsRef<Path>>(path: P) -> PureResult<Tensor> {
    let stored: StoredTensor =
        bincode::deserialize_from(open(path.as_ref())?).map_err(serde_error)?;
    stored.into_tensor()
}
