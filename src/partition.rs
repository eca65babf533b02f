//! Splitting the records into one contiguous chunk per rank.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::Rank;
use crate::record::Record;

/// A contiguous slice of the records owned by a single rank.
pub type Chunk = Vec<Record>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("cannot partition the records among zero workers")]
    NoWorkers,
}

/// How `len` items are split among `workers` chunks.
///
/// Every chunk receives `chunk_size` items and the first `remainder` chunks receive one more, so
/// the sizes differ by at most one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    pub workers: usize,
    pub chunk_size: usize,
    pub remainder: usize,
}

impl ChunkLayout {
    pub fn new(len: usize, workers: usize) -> Result<Self, PartitionError> {
        if workers == 0 {
            return Err(PartitionError::NoWorkers);
        }
        Ok(Self {
            workers,
            chunk_size: len / workers,
            remainder: len % workers,
        })
    }

    /// Total number of items described by this layout.
    pub fn total(&self) -> usize {
        self.chunk_size * self.workers + self.remainder
    }

    /// Number of items in the chunk of `rank`.
    pub fn len_of(&self, rank: Rank) -> usize {
        self.chunk_size + usize::from(rank < self.remainder)
    }

    /// Index range of the chunk of `rank` inside the full sequence.
    pub fn bounds(&self, rank: Rank) -> Range<usize> {
        let start = rank * self.chunk_size + rank.min(self.remainder);
        start..start + self.len_of(rank)
    }

    /// Index ranges of all the chunks, in rank order.
    pub fn all_bounds(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.workers).map(|rank| self.bounds(rank))
    }
}

/// Split `items` into `workers` contiguous chunks, in rank order.
///
/// The items are moved into the chunks, their relative order is preserved. An empty input produces
/// `workers` empty chunks.
pub fn partition<T>(items: Vec<T>, workers: usize) -> Result<Vec<Vec<T>>, PartitionError> {
    let layout = ChunkLayout::new(items.len(), workers)?;
    let mut items = items.into_iter();
    let chunks = layout
        .all_bounds()
        .map(|range| items.by_ref().take(range.len()).collect())
        .collect();
    debug_assert!(items.next().is_none());
    Ok(chunks)
}
