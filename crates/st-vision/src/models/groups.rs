// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Addressable parameter groups for weight surgery.
//!
//! A group selection is an ordered list of logical layer indices. Index
//! [`HEAD_GROUP`] names the classifier head, whose weights are handled per
//! class ("distinct"); every other index names inner tensors that are shared
//! across classes and flattened into one vector. [`WeightSchema`] fixes the
//! flattening order once so that extraction and injection cannot disagree.

use st_nn::module::Module;
use st_nn::PureResult;
use st_tensor::{Tensor, TensorError};
use std::collections::{BTreeSet, HashMap};

/// Logical index of the classifier head.
pub const HEAD_GROUP: usize = 1;

/// Backbones whose parameters can be addressed by logical layer index.
pub trait GroupedBackbone: Module {
    fn num_classes(&self) -> usize;

    /// Canonical names of the head weight `(in, classes)` and bias `(1, classes)`.
    fn head_parameter_names(&self) -> (String, String);

    /// Parameter names selected by a non-head index, in flattening order.
    fn group_parameter_names(&self, index: usize) -> PureResult<Vec<String>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SchemaEntry {
    name: String,
    shape: (usize, usize),
    offset: usize,
}

impl SchemaEntry {
    fn numel(&self) -> usize {
        self.shape.0 * self.shape.1
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct HeadEntry {
    weight: String,
    bias: String,
    feature_dim: usize,
    classes: usize,
}

/// Per-class head rows and the flattened shared tensors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractedWeights {
    pub distinct: Vec<Vec<f32>>,
    pub shared: Vec<f32>,
}

/// Ordered `(parameter, shape)` layout built once for a backbone and a
/// selection of layer indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightSchema {
    indices: Vec<usize>,
    head: Option<HeadEntry>,
    shared: Vec<SchemaEntry>,
    shared_len: usize,
}

fn parameter_shapes<M: Module + ?Sized>(model: &M) -> PureResult<HashMap<String, (usize, usize)>> {
    let mut shapes = HashMap::new();
    model.visit_parameters(&mut |param| {
        shapes.insert(param.name().to_string(), param.value().shape());
        Ok(())
    })?;
    Ok(shapes)
}

fn lookup(shapes: &HashMap<String, (usize, usize)>, name: &str) -> PureResult<(usize, usize)> {
    shapes
        .get(name)
        .copied()
        .ok_or_else(|| TensorError::MissingParameter {
            name: name.to_string(),
        })
}

impl WeightSchema {
    /// Resolves `layer_indices` against `model`. Indices are sorted and
    /// deduplicated; an index the backbone does not know is an error.
    pub fn build<M: GroupedBackbone + ?Sized>(model: &M, layer_indices: &[usize]) -> PureResult<Self> {
        let indices: Vec<usize> = layer_indices
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let shapes = parameter_shapes(model)?;

        let mut head = None;
        let mut shared = Vec::new();
        let mut offset = 0usize;
        for &index in &indices {
            if index == HEAD_GROUP {
                let (weight, bias) = model.head_parameter_names();
                let (feature_dim, classes) = lookup(&shapes, &weight)?;
                if lookup(&shapes, &bias)? != (1, classes) || classes != model.num_classes() {
                    return Err(TensorError::ShapeMismatch {
                        left: (1, model.num_classes()),
                        right: (feature_dim, classes),
                    });
                }
                head = Some(HeadEntry {
                    weight,
                    bias,
                    feature_dim,
                    classes,
                });
                continue;
            }
            for name in model.group_parameter_names(index)? {
                let shape = lookup(&shapes, &name)?;
                let entry = SchemaEntry {
                    name,
                    shape,
                    offset,
                };
                offset += entry.numel();
                shared.push(entry);
            }
        }
        Ok(Self {
            indices,
            head,
            shared,
            shared_len: offset,
        })
    }

    /// Sorted, deduplicated indices this schema was built from.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn includes_head(&self) -> bool {
        self.head.is_some()
    }

    /// Length of each distinct row: head fan-in plus one bias value. Zero when
    /// the head is not selected.
    pub fn distinct_len(&self) -> usize {
        self.head.as_ref().map_or(0, |head| head.feature_dim + 1)
    }

    pub fn shared_len(&self) -> usize {
        self.shared_len
    }

    /// Parameter names of the shared section in flattening order.
    pub fn shared_names(&self) -> impl Iterator<Item = &str> {
        self.shared.iter().map(|entry| entry.name.as_str())
    }

    /// Copies the selected parameters out of `model`.
    pub fn extract<M: Module + ?Sized>(&self, model: &M) -> PureResult<ExtractedWeights> {
        let mut values: HashMap<String, Tensor> = HashMap::new();
        model.visit_parameters(&mut |param| {
            if self.wants(param.name()) {
                values.insert(param.name().to_string(), param.value().clone());
            }
            Ok(())
        })?;
        let fetch = |name: &str| {
            values.get(name).ok_or_else(|| TensorError::MissingParameter {
                name: name.to_string(),
            })
        };

        let mut distinct = Vec::new();
        if let Some(head) = &self.head {
            let weight = fetch(&head.weight)?;
            let bias = fetch(&head.bias)?.data();
            distinct.reserve(head.classes);
            for class in 0..head.classes {
                let mut row = weight.column(class)?;
                row.push(bias[class]);
                distinct.push(row);
            }
        }

        let mut shared = Vec::with_capacity(self.shared_len);
        for entry in &self.shared {
            shared.extend_from_slice(fetch(&entry.name)?.data());
        }
        Ok(ExtractedWeights { distinct, shared })
    }

    /// Writes `distinct` rows into the head and consumes `shared` in schema
    /// order. Lengths are validated before anything is written.
    pub fn inject<M: Module + ?Sized>(
        &self,
        model: &mut M,
        distinct: &[Vec<f32>],
        shared: &[f32],
    ) -> PureResult<()> {
        self.validate(distinct, shared)?;
        let mut written = 0usize;
        model.visit_parameters_mut(&mut |param| {
            if let Some(head) = &self.head {
                if param.name() == head.weight {
                    let value = param.value_mut();
                    for (class, row) in distinct.iter().enumerate() {
                        value.set_column(class, &row[..head.feature_dim])?;
                    }
                    written += 1;
                    return Ok(());
                }
                if param.name() == head.bias {
                    let bias = param.value_mut().data_mut();
                    for (class, row) in distinct.iter().enumerate() {
                        bias[class] = row[head.feature_dim];
                    }
                    written += 1;
                    return Ok(());
                }
            }
            if let Some(entry) = self.shared.iter().find(|entry| entry.name == param.name()) {
                let slice = &shared[entry.offset..entry.offset + entry.numel()];
                let tensor = Tensor::from_vec(entry.shape.0, entry.shape.1, slice.to_vec())?;
                param.load_value(&tensor)?;
                written += 1;
            }
            Ok(())
        })?;
        let expected = self.shared.len() + if self.head.is_some() { 2 } else { 0 };
        if written != expected {
            return Err(TensorError::DataLength {
                expected,
                got: written,
            });
        }
        Ok(())
    }

    fn wants(&self, name: &str) -> bool {
        self.head
            .as_ref()
            .is_some_and(|head| head.weight == name || head.bias == name)
            || self.shared.iter().any(|entry| entry.name == name)
    }

    fn validate(&self, distinct: &[Vec<f32>], shared: &[f32]) -> PureResult<()> {
        let classes = self.head.as_ref().map_or(0, |head| head.classes);
        if distinct.len() != classes {
            return Err(TensorError::DataLength {
                expected: classes,
                got: distinct.len(),
            });
        }
        let row_len = self.distinct_len();
        if let Some(row) = distinct.iter().find(|row| row.len() != row_len) {
            return Err(TensorError::DataLength {
                expected: row_len,
                got: row.len(),
            });
        }
        if shared.len() != self.shared_len {
            return Err(TensorError::DataLength {
                expected: self.shared_len,
                got: shared.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resnet::{ResNetClassifier, ResNetConfig};

    fn model() -> ResNetClassifier {
        let config = ResNetConfig {
            input_channels: 1,
            input_hw: (4, 4),
            stem_channels: 2,
            stem_kernel: (3, 3),
            stem_stride: (1, 1),
            stem_padding: (1, 1),
            use_max_pool: false,
            stage_channels: vec![2, 3],
            num_classes: 4,
        };
        ResNetClassifier::new(config, 11).unwrap()
    }

    #[test]
    fn schema_orders_shared_tensors_by_ascending_index() {
        let model = model();
        let schema = WeightSchema::build(&model, &[3, 1, 2, 2]).unwrap();
        assert_eq!(schema.indices(), &[1, 2, 3]);
        let names: Vec<&str> = schema.shared_names().collect();
        assert_eq!(
            names,
            vec![
                "stage1.conv2::weight",
                "stage1.bn2::gamma",
                "stage0.conv2::weight",
                "stage0.bn2::gamma",
            ]
        );
        // stage1.conv2: 3 x (3*9), bn2: 3, stage0.conv2: 2 x (2*9), bn2: 2
        assert_eq!(schema.shared_len(), 81 + 3 + 36 + 2);
        assert_eq!(schema.distinct_len(), 4);
    }

    #[test]
    fn distinct_rows_are_head_columns_plus_bias() {
        let mut model = model();
        model.head_mut().bias_mut().value_mut().data_mut()[2] = 0.25;
        let extracted = WeightSchema::build(&model, &[1])
            .unwrap()
            .extract(&model)
            .unwrap();
        assert!(extracted.shared.is_empty());
        assert_eq!(extracted.distinct.len(), 4);
        let column = model.head().weight().value().column(2).unwrap();
        assert_eq!(&extracted.distinct[2][..3], column.as_slice());
        assert_eq!(extracted.distinct[2][3], 0.25);
    }

    #[test]
    fn injection_rejects_wrong_lengths_without_writing() {
        let mut model = model();
        let before = model.state_dict().unwrap();
        let schema = WeightSchema::build(&model, &[1, 2]).unwrap();
        let mut weights = schema.extract(&model).unwrap();
        weights.shared.pop();
        for row in &mut weights.distinct {
            row.iter_mut().for_each(|v| *v = 9.0);
        }
        assert!(schema
            .inject(&mut model, &weights.distinct, &weights.shared)
            .is_err());
        assert_eq!(model.state_dict().unwrap(), before);
    }

    #[test]
    fn unknown_index_is_a_configuration_error() {
        let model = model();
        assert!(matches!(
            WeightSchema::build(&model, &[1, 7]),
            Err(TensorError::UnknownParameterGroup { index: 7 })
        ));
    }
}
