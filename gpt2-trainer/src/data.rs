use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};
use crate::io as file_io;
use crate::tokenizer::Tokenizer;

/// Fixed-length token rows. Each row yields one (X, y) pair of length
/// `row_len - 1`.
#[derive(Debug, Clone)]
pub struct Dataset {
    tokens: Vec<u32>,
    row_len: usize,
}

impl Dataset {
    /// Chunks a token stream into rows of `row_len`; the last row is padded
    /// with `pad_id`.
    pub fn from_token_stream(mut tokens: Vec<u32>, row_len: usize, pad_id: u32) -> Result<Self> {
        if row_len < 2 {
            return Err(Error::Config(format!(
                "row length {row_len} leaves no target positions"
            )));
        }
        let rem = tokens.len() % row_len;
        if rem != 0 {
            tokens.resize(tokens.len() + row_len - rem, pad_id);
        }
        Ok(Self { tokens, row_len })
    }

    /// Tokenizes documents, appending EOS after each, and packs them into
    /// rows.
    pub fn from_texts(texts: &[String], tokenizer: &Tokenizer, row_len: usize) -> Result<Self> {
        let texts: Vec<&str> = texts
            .iter()
            .map(String::as_str)
            .filter(|t| !t.is_empty())
            .collect();
        let mut tokens = Vec::new();
        for ids in tokenizer.encode_batch(&texts, false)? {
            tokens.extend(ids);
            tokens.push(tokenizer.eos_token_id());
        }
        Self::from_token_stream(tokens, row_len, tokenizer.pad_token_id())
    }

    /// Loads a JSONL file with a "text" field per line.
    /// Supports .gz and .zst/.zstd compressed files.
    pub fn from_jsonl<P: AsRef<Path>>(
        path: P,
        tokenizer: &Tokenizer,
        row_len: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let texts = file_io::read_jsonl_texts(path, "text")?;
        let dataset = Self::from_texts(&texts, tokenizer, row_len)?;
        info!(
            "Loaded {} documents from {} into {} rows of {} tokens",
            texts.len(),
            path.display(),
            dataset.len(),
            row_len
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.tokens.len() / self.row_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn row(&self, index: usize) -> &[u32] {
        &self.tokens[index * self.row_len..(index + 1) * self.row_len]
    }
}

/// Permutation of `0..len` determined entirely by `seed`.
pub fn shuffled_indices(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    indices
}

/// This rank's share of `0..len`.
///
/// The (optionally shuffled) order is padded by wrapping around until it
/// divides evenly by `world_size`, then dealt out with stride `world_size`.
/// Every rank gets the same number of rows.
pub fn shard_indices(len: usize, world_size: usize, rank: usize, seed: Option<u64>) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mut indices = match seed {
        Some(seed) => shuffled_indices(len, seed),
        None => (0..len).collect(),
    };
    let total = len.div_ceil(world_size) * world_size;
    let mut i = 0;
    while indices.len() < total {
        indices.push(indices[i % len]);
        i += 1;
    }
    indices.into_iter().skip(rank).step_by(world_size).collect()
}

/// A batch of rows, `[batch, row_len]`.
pub struct Batch {
    pub tokens: Tensor,
}

impl Batch {
    /// Shifted next-token pair: X drops the last column, y the first.
    pub fn split(&self) -> Result<(Tensor, Tensor)> {
        let (_, row_len) = self.tokens.dims2()?;
        let x = self.tokens.narrow(1, 0, row_len - 1)?.contiguous()?;
        let y = self.tokens.narrow(1, 1, row_len - 1)?.contiguous()?;
        Ok((x, y))
    }
}

/// Per-rank batch iterator over a [`Dataset`].
///
/// With shuffling on, epoch `e` uses seed `seed + e`, so all ranks agree on
/// the global order without communicating.
pub struct ShardedLoader {
    dataset: Dataset,
    batch_size: usize,
    world_size: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
}

impl ShardedLoader {
    pub fn new(
        dataset: Dataset,
        batch_size: usize,
        world_size: usize,
        rank: usize,
        shuffle: bool,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            world_size: world_size.max(1),
            rank,
            shuffle,
            seed,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    fn shard_len(&self) -> usize {
        self.dataset.len().div_ceil(self.world_size)
    }

    /// Batches per epoch on this rank; the final partial batch counts.
    pub fn num_batches(&self) -> usize {
        self.shard_len().div_ceil(self.batch_size)
    }

    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let seed = self
            .shuffle
            .then(|| self.seed.wrapping_add(epoch as u64));
        shard_indices(self.dataset.len(), self.world_size, self.rank, seed)
    }

    pub fn batches(&self, epoch: usize, device: &Device) -> Batches<'_> {
        Batches {
            loader: self,
            indices: self.epoch_indices(epoch),
            pos: 0,
            device: device.clone(),
        }
    }

    fn make_batch(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let row_len = self.dataset.row_len();
        let mut data = Vec::with_capacity(indices.len() * row_len);
        for &i in indices {
            data.extend_from_slice(self.dataset.row(i));
        }
        let tokens = Tensor::from_vec(data, (indices.len(), row_len), device)?;
        Ok(Batch { tokens })
    }
}

pub struct Batches<'a> {
    loader: &'a ShardedLoader,
    indices: Vec<usize>,
    pos: usize,
    device: Device,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.indices.len() {
            return None;
        }
        let end = (self.pos + self.loader.batch_size).min(self.indices.len());
        let batch = self
            .loader
            .make_batch(&self.indices[self.pos..end], &self.device);
        self.pos = end;
        Some(batch)
    }

    /// Skips whole batches without assembling them.
    fn nth(&mut self, n: usize) -> Option<Self::Item> {
        self.pos = n
            .saturating_mul(self.loader.batch_size)
            .saturating_add(self.pos)
            .min(self.indices.len());
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::word_level_fixture;

    fn numbered(rows: usize, row_len: usize) -> Dataset {
        let tokens: Vec<u32> = (0..(rows * row_len) as u32).collect();
        Dataset::from_token_stream(tokens, row_len, 999).unwrap()
    }

    #[test]
    fn test_token_stream_pads_last_row() {
        let ds = Dataset::from_token_stream(vec![1, 2, 3, 4, 5], 3, 0).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.row(1), &[4, 5, 0]);
        assert!(Dataset::from_token_stream(vec![1], 1, 0).is_err());
    }

    #[test]
    fn test_from_texts_appends_eos() {
        let tokenizer = word_level_fixture(&["a", "b", "c"]);
        let texts = vec!["a b".to_string(), String::new(), "c".to_string()];
        let ds = Dataset::from_texts(&texts, &tokenizer, 4).unwrap();
        let pad = tokenizer.pad_token_id();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.row(0), &[2, 3, 0, 4]);
        assert_eq!(ds.row(1), &[0, pad, pad, pad]);
    }

    #[test]
    fn test_shuffled_indices_is_pure() {
        let a = shuffled_indices(50, 3);
        assert_eq!(a, shuffled_indices(50, 3));
        assert_ne!(a, shuffled_indices(50, 4));
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_shards_partition_padded_order() {
        let world = 4;
        let shards: Vec<Vec<usize>> = (0..world)
            .map(|rank| shard_indices(10, world, rank, Some(7)))
            .collect();
        assert!(shards.iter().all(|s| s.len() == 3));

        let order = shuffled_indices(10, 7);
        let mut interleaved = Vec::new();
        for i in 0..3 {
            for shard in &shards {
                interleaved.push(shard[i]);
            }
        }
        assert_eq!(&interleaved[..10], &order[..]);
        assert_eq!(&interleaved[10..], &order[..2]);
    }

    #[test]
    fn test_unshuffled_shard_is_strided() {
        assert_eq!(shard_indices(5, 2, 1, None), vec![1, 3, 0]);
        assert!(shard_indices(0, 2, 0, None).is_empty());
    }

    #[test]
    fn test_loader_keeps_partial_batch_and_reshuffles() {
        let loader = ShardedLoader::new(numbered(10, 4), 4, 1, 0, true, 0);
        assert_eq!(loader.num_batches(), 3);
        let sizes: Vec<usize> = loader
            .batches(1, &Device::Cpu)
            .map(|b| b.unwrap().tokens.dim(0).unwrap())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_ne!(loader.epoch_indices(1), loader.epoch_indices(2));
        assert_eq!(loader.epoch_indices(1), loader.epoch_indices(1));
    }

    #[test]
    fn test_skipped_batches_match_full_pass() {
        let loader = ShardedLoader::new(numbered(10, 4), 4, 1, 0, true, 3);
        let rows = |b: Batch| b.tokens.to_vec2::<u32>().unwrap();
        let full: Vec<_> = loader
            .batches(2, &Device::Cpu)
            .map(|b| rows(b.unwrap()))
            .collect();
        let resumed: Vec<_> = loader
            .batches(2, &Device::Cpu)
            .enumerate()
            .skip(2)
            .map(|(i, b)| (i, rows(b.unwrap())))
            .collect();
        assert_eq!(resumed, vec![(2, full[2].clone())]);
        assert!(loader.batches(2, &Device::Cpu).nth(3).is_none());
    }

    #[test]
    fn test_eval_loader_is_not_shuffled() {
        let loader = ShardedLoader::new(numbered(6, 3), 2, 2, 0, false, 0);
        assert_eq!(loader.epoch_indices(1), vec![0, 2, 4]);
        assert_eq!(loader.epoch_indices(5), vec![0, 2, 4]);
    }

    #[test]
    fn test_batch_split_shifts_by_one() {
        let loader = ShardedLoader::new(numbered(2, 4), 2, 1, 0, false, 0);
        let batch = loader.batches(1, &Device::Cpu).next().unwrap().unwrap();
        let (x, y) = batch.split().unwrap();
        assert_eq!(x.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 2], vec![4, 5, 6]]);
        assert_eq!(y.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3], vec![5, 6, 7]]);
    }
}
