use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

pub mod corpus;

pub use corpus::{DialogueDataset, JsonlDialogueCorpus, PairDataset, TokenizerVocabulary, Vocabulary};

use crate::{context::TrainingContext, context::WorkerRole, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Length limits applied when samples are tokenized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCaps {
    pub max_sentence_length: usize,
    pub max_passage_length: usize,
}

impl SequenceCaps {
    pub fn from_max_seq_len(max_seq_len: usize) -> Self {
        Self {
            max_sentence_length: max_seq_len / 4,
            max_passage_length: max_seq_len,
        }
    }
}

/// A batch of token ids on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, P]`
    pub prompt: Tensor,
    /// `[B, S]`
    pub label: Tensor,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.prompt.dims().first().copied().unwrap_or(0)
    }

    /// Decoder input and expected output: `(label[:, :-1], label[:, 1:])`.
    pub fn shift_labels(&self) -> Result<(Tensor, Tensor)> {
        let (_, len) = self.label.dims2()?;
        if len < 2 {
            return Err(TrainingError::runtime(format!(
                "label rows need at least two tokens to shift, found {len}"
            )));
        }
        let input = self.label.narrow(1, 0, len - 1)?;
        let expected = self.label.narrow(1, 1, len - 1)?;
        Ok((input, expected))
    }
}

/// Builds device tensors from token rows.
#[derive(Debug, Clone)]
pub struct DevicePlacement {
    device: Device,
}

impl DevicePlacement {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Stacks rows into a `[rows, longest]` u32 tensor, right-padding shorter
    /// rows with `pad`.
    pub fn place(&self, rows: &[Vec<u32>], pad: u32) -> Result<Tensor> {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut flat = Vec::with_capacity(rows.len() * width);
        for row in rows {
            flat.extend_from_slice(row);
            flat.extend(std::iter::repeat(pad).take(width - row.len()));
        }
        Ok(Tensor::from_vec(flat, (rows.len(), width), &self.device)?)
    }
}

/// Splits a dataset into this worker's share and yields device batches.
pub struct DataPipeline {
    dataset: Arc<dyn DialogueDataset>,
    batch_size: usize,
    role: WorkerRole,
    placement: DevicePlacement,
    seed: u64,
    pad_index: u32,
}

impl DataPipeline {
    pub fn new(
        dataset: Arc<dyn DialogueDataset>,
        batch_size: usize,
        ctx: &TrainingContext,
        seed: u64,
        pad_index: u32,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if dataset.is_empty() {
            return Err(TrainingError::initialization("dataset contains no samples"));
        }

        Ok(Self {
            dataset,
            batch_size,
            role: ctx.role(),
            placement: DevicePlacement::new(ctx.device().clone()),
            seed,
            pad_index,
        })
    }

    /// Samples this worker draws per epoch.
    pub fn samples_per_worker(&self) -> usize {
        match self.role {
            WorkerRole::Single => self.dataset.len(),
            WorkerRole::Distributed { world_size, .. } => self.dataset.len().div_ceil(world_size),
        }
    }

    pub fn num_batches(&self) -> usize {
        self.samples_per_worker().div_ceil(self.batch_size)
    }

    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        match self.role {
            WorkerRole::Single => (0..self.dataset.len()).collect(),
            WorkerRole::Distributed { rank, world_size } => {
                partition_indices(self.dataset.len(), rank, world_size, self.seed, epoch)
            }
        }
    }

    pub fn batches(&self, epoch: usize) -> Batches {
        Batches {
            dataset: Arc::clone(&self.dataset),
            indices: self.indices(epoch),
            cursor: 0,
            batch_size: self.batch_size,
            placement: self.placement.clone(),
            pad_index: self.pad_index,
        }
    }
}

/// Owned iterator over one epoch of batches. The last batch may be short.
pub struct Batches {
    dataset: Arc<dyn DialogueDataset>,
    indices: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    placement: DevicePlacement,
    pad_index: u32,
}

impl Batches {
    fn assemble(&self, indices: &[usize]) -> Result<Batch> {
        let mut prompts = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            let (prompt, label) = self.dataset.get(index)?;
            prompts.push(prompt);
            labels.push(label);
        }
        Ok(Batch {
            prompt: self.placement.place(&prompts, self.pad_index)?,
            label: self.placement.place(&labels, self.pad_index)?,
        })
    }
}

impl Iterator for Batches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let batch = self.assemble(&self.indices[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.indices.len() - self.cursor).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches {}

/// This rank's share of `0..len` for `epoch`.
///
/// The full index list is shuffled with a generator seeded by `seed + epoch`,
/// extended by wrapping around until it divides evenly by `world_size`, and
/// then strided from `rank`. Every rank gets `ceil(len / world_size)` indices.
pub fn partition_indices(
    len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    epoch: usize,
) -> Vec<usize> {
    if len == 0 || world_size == 0 {
        return Vec::new();
    }

    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
    indices.shuffle(&mut rng);

    let total = len.div_ceil(world_size) * world_size;
    let mut wrap = 0;
    while indices.len() < total {
        indices.push(indices[wrap % len]);
        wrap += 1;
    }

    indices.into_iter().skip(rank).step_by(world_size).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn dataset(rows: usize) -> Arc<dyn DialogueDataset> {
        let pairs = (0..rows)
            .map(|i| {
                let i = i as u32;
                (vec![i + 10; (i as usize % 3) + 1], vec![1, i + 10, 2])
            })
            .collect();
        Arc::new(PairDataset::new(pairs))
    }

    #[test]
    fn caps_follow_max_seq_len() {
        let caps = SequenceCaps::from_max_seq_len(50);
        assert_eq!(caps.max_sentence_length, 12);
        assert_eq!(caps.max_passage_length, 50);
    }

    #[test]
    fn partitions_cover_the_dataset_evenly() {
        let world_size = 4;
        let shares: Vec<Vec<usize>> = (0..world_size)
            .map(|rank| partition_indices(10, rank, world_size, 7, 1))
            .collect();

        for share in &shares {
            assert_eq!(share.len(), 3);
        }
        let seen: BTreeSet<usize> = shares.iter().flatten().copied().collect();
        assert_eq!(seen, (0..10).collect());
        assert_eq!(shares.iter().map(Vec::len).sum::<usize>(), 12);
    }

    #[test]
    fn partition_is_disjoint_when_divisible() {
        let first = partition_indices(8, 0, 2, 3, 0);
        let second = partition_indices(8, 1, 2, 3, 0);
        let overlap: BTreeSet<_> = first.iter().filter(|i| second.contains(i)).collect();
        assert!(overlap.is_empty());
    }

    #[test]
    fn partition_depends_on_epoch_only_through_seed() {
        let a = partition_indices(64, 1, 2, 0, 3);
        let b = partition_indices(64, 1, 2, 0, 3);
        let c = partition_indices(64, 1, 2, 0, 4);
        let d = partition_indices(64, 1, 2, 1, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c, d);
    }

    #[test]
    fn world_larger_than_dataset_wraps_around() {
        let shares: Vec<_> = (0..5).map(|rank| partition_indices(2, rank, 5, 0, 0)).collect();
        assert!(shares.iter().all(|share| share.len() == 1));
        assert!(shares.iter().flatten().all(|&i| i < 2));
    }

    #[test]
    fn single_worker_reads_sequentially_and_keeps_short_batch() {
        let ctx = TrainingContext::cpu(WorkerRole::Single);
        let pipeline = DataPipeline::new(dataset(5), 2, &ctx, 0, 0).unwrap();
        assert_eq!(pipeline.num_batches(), 3);
        assert_eq!(pipeline.indices(9), vec![0, 1, 2, 3, 4]);

        let batches: Vec<Batch> = pipeline.batches(1).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].batch_size(), 1);
        assert_eq!(batches[0].label.dims(), &[2, 3]);
    }

    #[test]
    fn distributed_workers_iterate_the_same_number_of_batches() {
        let data = dataset(7);
        let counts: Vec<usize> = (0..3)
            .map(|rank| {
                let ctx = TrainingContext::cpu(WorkerRole::Distributed {
                    rank,
                    world_size: 3,
                });
                let pipeline = DataPipeline::new(Arc::clone(&data), 2, &ctx, 0, 0).unwrap();
                assert_eq!(pipeline.samples_per_worker(), 3);
                pipeline.batches(1).count()
            })
            .collect();
        assert_eq!(counts, vec![2, 2, 2]);
    }

    #[test]
    fn rows_are_padded_to_the_longest() {
        let ctx = TrainingContext::cpu(WorkerRole::Single);
        let pipeline = DataPipeline::new(dataset(3), 3, &ctx, 0, 99).unwrap();
        let batch = pipeline.batches(1).next().unwrap().unwrap();
        let prompt = batch.prompt.to_vec2::<u32>().unwrap();
        assert_eq!(
            prompt,
            vec![vec![10, 99, 99], vec![11, 11, 99], vec![12, 12, 12]]
        );
    }

    #[test]
    fn shift_labels_offsets_targets_by_one() {
        let placement = DevicePlacement::new(Device::Cpu);
        let batch = Batch {
            prompt: placement.place(&[vec![5, 6]], 0).unwrap(),
            label: placement.place(&[vec![1, 7, 8, 2]], 0).unwrap(),
        };
        let (input, expected) = batch.shift_labels().unwrap();
        assert_eq!(input.to_vec2::<u32>().unwrap(), vec![vec![1, 7, 8]]);
        assert_eq!(expected.to_vec2::<u32>().unwrap(), vec![vec![7, 8, 2]]);

        let short = Batch {
            prompt: batch.prompt.clone(),
            label: placement.place(&[vec![1]], 0).unwrap(),
        };
        assert!(short.shift_labels().is_err());
    }

    #[test]
    fn rejects_empty_dataset_and_zero_batch() {
        let ctx = TrainingContext::cpu(WorkerRole::Single);
        assert!(matches!(
            DataPipeline::new(Arc::new(PairDataset::default()), 2, &ctx, 0, 0),
            Err(TrainingError::Initialization(_))
        ));
        assert!(matches!(
            DataPipeline::new(dataset(2), 0, &ctx, 0, 0),
            Err(TrainingError::Initialization(_))
        ));
    }
}
