//! Data loader

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::datasets::Dataset;

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,
    #[error("Cannot load batches from an empty dataset")]
    EmptyDataset,
}

/// Data loader, returns batches of dataset items optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader<'a, D: Dataset> {
    dataset: &'a D,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl<'a, D: Dataset> DataLoader<'a, D> {
    pub fn new(
        dataset: &'a D,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if dataset.is_empty() {
            return Err(DataLoaderError::EmptyDataset);
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            drop_last,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches one pass over the dataset yields
    pub fn num_batches(&self) -> usize {
        let len = self.dataset.len();
        if self.drop_last {
            len / self.batch_size
        } else {
            len.div_ceil(self.batch_size)
        }
    }

    /// Iterates over the dataset, shuffling with `rng` when shuffling is enabled.
    /// The rng is only used up front, so it is free again once this returns.
    pub fn iter_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'a, D> {
        let mut indices = (0..self.dataset.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        if self.drop_last {
            indices.truncate(self.num_batches() * self.batch_size);
        }
        DataLoaderIterator {
            dataset: self.dataset,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }

    pub fn iter(&self) -> DataLoaderIterator<'a, D> {
        self.iter_with_rng(&mut rand::rng())
    }
}

/// An iterator which returns mini batches of items until the end of the dataset
pub struct DataLoaderIterator<'a, D: Dataset> {
    dataset: &'a D,
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl<D: Dataset> Iterator for DataLoaderIterator<'_, D> {
    type Item = Vec<D::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.indices.len());
        let batch = self.indices[self.curr_iter..end]
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect::<Vec<_>>();
        self.curr_iter = end;
        Some(batch)
    }
}
