// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Class weight records and the weight mapper behind the Icus surgery.
//!
//! Every class contributes one record: an embedding of its canonical name, a
//! copy of its distinct head row, a copy of the shared parameter section and
//! its forget flag. The [`WeightMapper`] learns a residual over those
//! concatenated vectors; [`IcusDataset::surgery`] turns its predictions back
//! into weights for [`WeightSchema::inject`].

use crate::error::{UnlearnError, UnlearnResult};
use crate::forget::ResolvedForget;
use spiral_config::determinism::derive_seed;
use st_nn::loss::{scalar, Loss};
use st_nn::module::{Module, Parameter};
use st_nn::optim::Optimizer;
use st_nn::{AdamW, Linear, MeanSquaredError, PureResult, Relu, Tensor};
use st_vision::{ExtractedWeights, GroupedBackbone, WeightSchema};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use tracing::{debug, info, warn};

/// Maps canonical class names to fixed-size vectors.
pub trait ClassEmbedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, name: &str) -> Vec<f32>;

    fn embed_batch(&self, names: &[String]) -> Vec<Vec<f32>> {
        names.iter().map(|name| self.embed(name)).collect()
    }
}

/// Bag of hashed character trigrams, L2-normalised.
///
/// Names are lowercased and padded with spaces so short words still produce
/// boundary trigrams. An all-zero vector is only returned for an empty name.
/// Trigrams are hashed as UTF-8 with zero-keyed SipHash-2-4, so a name maps to
/// the same vector across processes and toolchains.
#[derive(Debug, Clone, Copy)]
pub struct HashedNgramEmbedder {
    dimension: usize,
}

impl HashedNgramEmbedder {
    pub fn new(dimension: usize) -> UnlearnResult<Self> {
        if dimension == 0 {
            return Err(UnlearnError::Config(
                "embedding dimension must be positive".to_string(),
            ));
        }
        Ok(Self { dimension })
    }
}

impl ClassEmbedder for HashedNgramEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, name: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let normalised = name.trim().to_lowercase();
        if normalised.is_empty() {
            return vector;
        }
        let padded: Vec<char> = format!(" {normalised} ").chars().collect();
        let mut gram = String::with_capacity(12);
        for window in padded.windows(3) {
            gram.clear();
            gram.extend(window);
            let mut hasher = SipHasher24::new();
            hasher.write(gram.as_bytes());
            let hash = hasher.finish();
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

fn cosine(lhs: &[f32], rhs: &[f32]) -> f32 {
    let dot: f32 = lhs.iter().zip(rhs).map(|(a, b)| a * b).sum();
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm(lhs) * norm(rhs);
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// Everything the weight mapper knows about one class. Weight vectors are
/// owned copies of the backbone's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeightRecord {
    pub class_id: usize,
    pub embedding: Vec<f32>,
    pub distinct: Vec<f32>,
    pub shared: Vec<f32>,
    pub forget: bool,
}

impl ClassWeightRecord {
    /// `distinct ++ shared`.
    pub fn weights(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.distinct.len() + self.shared.len());
        out.extend_from_slice(&self.distinct);
        out.extend_from_slice(&self.shared);
        out
    }
}

/// Weights the surgery writes back into the backbone.
#[derive(Debug, Clone, PartialEq)]
pub struct SurgeryPlan {
    pub weights: ExtractedWeights,
    /// Final mapper loss, `NaN` when the mapper never ran.
    pub mapper_loss: f32,
}

/// One record per class plus the schema they were extracted with.
#[derive(Debug, Clone)]
pub struct IcusDataset {
    schema: WeightSchema,
    records: Vec<ClassWeightRecord>,
    /// Mean embedding of the forget classes, appended to every mapper input.
    context: Vec<f32>,
}

impl IcusDataset {
    pub fn build<M, E>(
        model: &M,
        embedder: &E,
        class_names: &[String],
        forget: &ResolvedForget,
        layer_indices: &[usize],
    ) -> UnlearnResult<Self>
    where
        M: GroupedBackbone + ?Sized,
        E: ClassEmbedder + ?Sized,
    {
        let classes = model.num_classes();
        if class_names.len() != classes {
            return Err(UnlearnError::Config(format!(
                "{} class names for a backbone with {classes} classes",
                class_names.len()
            )));
        }
        let schema = WeightSchema::build(model, layer_indices)?;
        let ExtractedWeights { distinct, shared } = schema.extract(model)?;
        let embeddings = embedder.embed_batch(class_names);
        let flags = forget.flags();

        let records: Vec<ClassWeightRecord> = embeddings
            .into_iter()
            .enumerate()
            .map(|(class_id, embedding)| ClassWeightRecord {
                class_id,
                embedding,
                distinct: distinct.get(class_id).cloned().unwrap_or_default(),
                shared: shared.clone(),
                forget: flags.get(class_id).copied().unwrap_or(false),
            })
            .collect();

        let mut context = vec![0.0f32; embedder.dimension()];
        let forgotten: Vec<&ClassWeightRecord> = records.iter().filter(|r| r.forget).collect();
        for record in &forgotten {
            for (slot, value) in context.iter_mut().zip(&record.embedding) {
                *slot += value / forgotten.len() as f32;
            }
        }
        info!(
            classes,
            forget = forgotten.len(),
            distinct = schema.distinct_len(),
            shared = schema.shared_len(),
            layers = ?schema.indices(),
            "built class weight records"
        );
        Ok(Self {
            schema,
            records,
            context,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ClassWeightRecord] {
        &self.records
    }

    pub fn schema(&self) -> &WeightSchema {
        &self.schema
    }

    /// Width of one mapper input row.
    pub fn input_dim(&self) -> usize {
        2 * self.context.len() + 1
    }

    /// Width of one weight vector.
    pub fn output_dim(&self) -> usize {
        self.schema.distinct_len() + self.schema.shared_len()
    }

    /// `[embedding ‖ flag ‖ context]` for every class.
    pub fn inputs(&self) -> PureResult<Tensor> {
        let width = self.input_dim();
        let mut data = Vec::with_capacity(self.records.len() * width);
        for record in &self.records {
            data.extend_from_slice(&record.embedding);
            data.push(if record.forget { 1.0 } else { 0.0 });
            data.extend_from_slice(&self.context);
        }
        Tensor::from_vec(self.records.len(), width, data)
    }

    /// Current weight vectors, one row per class.
    pub fn current_weights(&self) -> PureResult<Tensor> {
        let data: Vec<f32> = self.records.iter().flat_map(|r| r.weights()).collect();
        Tensor::from_vec(self.records.len(), self.output_dim(), data)
    }

    /// The retain class whose embedding is least similar to `record`.
    fn neutral_donor(&self, record: &ClassWeightRecord) -> Option<&ClassWeightRecord> {
        self.records
            .iter()
            .filter(|candidate| !candidate.forget)
            .min_by(|a, b| {
                cosine(&record.embedding, &a.embedding)
                    .total_cmp(&cosine(&record.embedding, &b.embedding))
            })
    }

    /// Target weight vectors: retain classes keep their weights, forget
    /// classes take a neutral donor's distinct row with its bias lowered by
    /// `margin`.
    pub fn targets(&self, margin: f32) -> PureResult<Tensor> {
        let distinct_len = self.schema.distinct_len();
        let mut data = Vec::with_capacity(self.records.len() * self.output_dim());
        for record in &self.records {
            if !record.forget {
                data.extend(record.weights());
                continue;
            }
            let mut distinct = match self.neutral_donor(record) {
                Some(donor) => donor.distinct.clone(),
                None => vec![0.0; distinct_len],
            };
            if let Some(bias) = distinct.last_mut() {
                *bias -= margin;
            }
            data.extend(distinct);
            data.extend_from_slice(&record.shared);
        }
        Tensor::from_vec(self.records.len(), self.output_dim(), data)
    }

    /// Trains `mapper` to predict target residuals and returns the weights to
    /// inject.
    pub fn surgery(
        &self,
        mapper: &mut WeightMapper,
        optimizer: &mut dyn Optimizer,
        epochs: usize,
        margin: f32,
    ) -> UnlearnResult<SurgeryPlan> {
        let inputs = self.inputs()?;
        let current = self.current_weights()?;
        let residual = self.targets(margin)?.sub(&current)?;
        let mut criterion = MeanSquaredError::new();
        let mut mapper_loss = f32::NAN;
        for epoch in 0..epochs {
            let prediction = mapper.forward(&inputs)?;
            mapper_loss = scalar(&criterion.forward(&prediction, &residual)?);
            let grad = criterion.backward(&prediction, &residual)?;
            mapper.backward(&inputs, &grad)?;
            optimizer.step(mapper)?;
            if epoch % 50 == 0 {
                debug!(epoch, loss = mapper_loss, "weight mapper epoch");
            }
        }
        let predicted = current.add(&mapper.forward(&inputs)?)?;
        let plan = self.assemble(&predicted)?;
        info!(loss = mapper_loss, epochs, "weight mapper trained");
        Ok(SurgeryPlan {
            weights: plan,
            mapper_loss,
        })
    }

    /// Splits predicted rows into head rows and one shared vector averaged
    /// over the retain classes.
    fn assemble(&self, predicted: &Tensor) -> PureResult<ExtractedWeights> {
        let distinct_len = self.schema.distinct_len();
        let mut distinct = Vec::new();
        if self.schema.includes_head() {
            for class in 0..self.records.len() {
                distinct.push(predicted.row(class)?[..distinct_len].to_vec());
            }
        }
        let retain: Vec<usize> = self
            .records
            .iter()
            .filter(|r| !r.forget)
            .map(|r| r.class_id)
            .collect();
        let shared = if retain.is_empty() {
            warn!("no retain classes, keeping the original shared weights");
            self.records
                .first()
                .map(|r| r.shared.clone())
                .unwrap_or_default()
        } else {
            let mut mean = vec![0.0f32; self.schema.shared_len()];
            for &class in &retain {
                let row = &predicted.row(class)?[distinct_len..];
                for (slot, value) in mean.iter_mut().zip(row) {
                    *slot += value / retain.len() as f32;
                }
            }
            mean
        };
        Ok(ExtractedWeights { distinct, shared })
    }
}

/// Two-layer perceptron predicting a residual over class weight vectors.
#[derive(Debug, Clone)]
pub struct WeightMapper {
    input: Linear,
    activation: Relu,
    output: Linear,
}

impl WeightMapper {
    pub fn new(input_dim: usize, hidden_dim: usize, output_dim: usize, seed: u64) -> PureResult<Self> {
        let mut output = Linear::new(
            "mapper.out",
            hidden_dim,
            output_dim,
            Some(derive_seed(seed, "mapper.out")),
        )?;
        // Start from the identity map over the current weights.
        output
            .weight_mut()
            .load_value(&Tensor::zeros(hidden_dim, output_dim)?)?;
        Ok(Self {
            input: Linear::new(
                "mapper.in",
                input_dim,
                hidden_dim,
                Some(derive_seed(seed, "mapper.in")),
            )?,
            activation: Relu::new(),
            output,
        })
    }

    pub fn for_dataset(dataset: &IcusDataset, hidden_dim: usize, seed: u64) -> PureResult<Self> {
        Self::new(dataset.input_dim(), hidden_dim, dataset.output_dim(), seed)
    }
}

impl Module for WeightMapper {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let hidden = self.activation.forward(&self.input.forward(input)?)?;
        self.output.forward(&hidden)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let pre = self.input.forward(input)?;
        let hidden = self.activation.forward(&pre)?;
        let grad_hidden = self.output.backward(&hidden, grad_output)?;
        let grad_pre = self.activation.backward(&pre, &grad_hidden)?;
        self.input.backward(input, &grad_pre)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.input.visit_parameters(visitor)?;
        self.output.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.input.visit_parameters_mut(visitor)?;
        self.output.visit_parameters_mut(visitor)
    }
}

/// AdamW over the mapper, the optimiser the surgery trains with.
pub fn mapper_optimizer(learning_rate: f32) -> PureResult<AdamW> {
    AdamW::new(learning_rate)
}
