// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor};
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// Samples that know how to stack themselves into a mini-batch.
pub trait Collate: Send + Sync + 'static {
    type Batch: Send + 'static;

    fn collate(samples: &[&Self]) -> PureResult<Self::Batch>;
}

impl Collate for (Tensor, Tensor) {
    type Batch = (Tensor, Tensor);

    fn collate(samples: &[&Self]) -> PureResult<Self::Batch> {
        let inputs: Vec<Tensor> = samples.iter().map(|(input, _)| input.clone()).collect();
        let targets: Vec<Tensor> = samples.iter().map(|(_, target)| target.clone()).collect();
        Ok((Tensor::cat_rows(&inputs)?, Tensor::cat_rows(&targets)?))
    }
}

fn gather<S: Collate>(samples: &[S], indices: &[usize]) -> PureResult<S::Batch> {
    let batch: Vec<&S> = indices.iter().map(|&idx| &samples[idx]).collect();
    S::collate(&batch)
}

struct ImmediateBatches<S: Collate> {
    samples: Arc<[S]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    position: usize,
}

impl<S: Collate> Iterator for ImmediateBatches<S> {
    type Item = PureResult<S::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let start = self.position;
        let end = (start + self.batch_size).min(self.order.len());
        self.position = end;
        Some(gather(&self.samples, &self.order[start..end]))
    }
}

struct PrefetchBatches<S: Collate> {
    rx: Receiver<PureResult<S::Batch>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<S: Collate> PrefetchBatches<S> {
    fn spawn(samples: Arc<[S]>, order: Arc<Vec<usize>>, batch_size: usize, depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let handle = thread::spawn(move || {
            for indices in order.chunks(batch_size) {
                if tx.send(gather(&samples, indices)).is_err() {
                    return;
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }
}

impl<S: Collate> Iterator for PrefetchBatches<S> {
    type Item = PureResult<S::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl<S: Collate> Drop for PrefetchBatches<S> {
    fn drop(&mut self) {
        // Hang up first so a producer blocked on a full channel gets a send error.
        let (_, detached) = mpsc::sync_channel(0);
        drop(std::mem::replace(&mut self.rx, detached));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Backend<S: Collate> {
    Immediate(ImmediateBatches<S>),
    Prefetch(PrefetchBatches<S>),
}

/// Iterator over mini-batches produced by a [`DataLoader`].
pub struct Batches<S: Collate> {
    backend: Backend<S>,
}

impl<S: Collate> Iterator for Batches<S> {
    type Item = PureResult<S::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.backend {
            Backend::Immediate(iter) => iter.next(),
            Backend::Prefetch(iter) => iter.next(),
        }
    }
}

/// Builder-style loader with deterministic shuffling, fixed batch sizes and
/// optional background prefetch.
pub struct DataLoader<S: Collate> {
    samples: Arc<[S]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    prefetch: usize,
}

impl<S: Collate> Clone for DataLoader<S> {
    fn clone(&self) -> Self {
        Self {
            samples: Arc::clone(&self.samples),
            order: Arc::clone(&self.order),
            batch_size: self.batch_size,
            prefetch: self.prefetch,
        }
    }
}

impl<S: Collate> DataLoader<S> {
    pub fn from_vec(samples: Vec<S>) -> Self {
        let len = samples.len();
        Self {
            samples: samples.into(),
            order: Arc::new((0..len).collect()),
            batch_size: 1,
            prefetch: 0,
        }
    }

    /// Number of individual samples referenced by the loader.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    pub fn samples(&self) -> &[S] {
        &self.samples
    }

    /// Deterministically shuffles the visitation order using `seed`.
    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        self.order = Arc::new(indices);
        self
    }

    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Enables background prefetching with the given channel depth. Zero keeps
    /// batches on the calling thread.
    pub fn prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }

    pub fn iter(&self) -> Batches<S> {
        let samples = Arc::clone(&self.samples);
        let order = Arc::clone(&self.order);
        let backend = if self.prefetch == 0 {
            Backend::Immediate(ImmediateBatches {
                samples,
                order,
                batch_size: self.batch_size,
                position: 0,
            })
        } else {
            Backend::Prefetch(PrefetchBatches::spawn(
                samples,
                order,
                self.batch_size,
                self.prefetch,
            ))
        };
        Batches { backend }
    }
}

impl<S: Collate> IntoIterator for &DataLoader<S> {
    type Item = PureResult<S::Batch>;
    type IntoIter = Batches<S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Vec<(Tensor, Tensor)> {
        (0..n)
            .map(|i| {
                (
                    Tensor::from_vec(1, 2, vec![i as f32, -(i as f32)]).unwrap(),
                    Tensor::from_vec(1, 1, vec![i as f32]).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn batches_stack_rows_and_keep_the_tail() {
        let loader = DataLoader::from_vec(samples(5)).batched(2);
        let shapes: Vec<_> = loader.iter().map(|b| b.unwrap().0.shape()).collect();
        assert_eq!(shapes, vec![(2, 2), (2, 2), (1, 2)]);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn shuffling_is_seeded_and_a_permutation() {
        let first: Vec<f32> = DataLoader::from_vec(samples(6))
            .shuffle(42)
            .iter()
            .map(|b| b.unwrap().1.data()[0])
            .collect();
        let again: Vec<f32> = DataLoader::from_vec(samples(6))
            .shuffle(42)
            .iter()
            .map(|b| b.unwrap().1.data()[0])
            .collect();
        assert_eq!(first, again);
        let mut sorted = first.clone();
        sorted.sort_by(f32::total_cmp);
        assert_eq!(sorted, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn prefetch_matches_eager() {
        let eager: Vec<_> = DataLoader::from_vec(samples(8))
            .batched(3)
            .iter()
            .map(|b| b.unwrap().0)
            .collect();
        let prefetched: Vec<_> = DataLoader::from_vec(samples(8))
            .batched(3)
            .prefetch(2)
            .iter()
            .map(|b| b.unwrap().0)
            .collect();
        assert_eq!(eager, prefetched);
    }

    #[test]
    fn dropping_a_prefetching_iterator_early_does_not_hang() {
        let loader = DataLoader::from_vec(samples(32)).prefetch(1);
        let mut iter = loader.iter();
        assert!(iter.next().is_some());
        drop(iter);
    }
}
