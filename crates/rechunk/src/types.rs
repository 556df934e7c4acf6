//! Core types: array descriptors, chunk shapes and the blocks they induce.

use serde::{Deserialize, Serialize};

use crate::error::{RechunkError, Result};

/// Per-axis chunk extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkShape(pub Vec<u64>);

impl ChunkShape {
    pub fn new(extents: impl Into<Vec<u64>>) -> Self {
        Self(extents.into())
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Number of elements in one full chunk.
    pub fn num_elements(&self) -> u64 {
        self.0.iter().product()
    }

    /// Number of chunks along each axis for an array of `shape`.
    pub fn grid(&self, shape: &[u64]) -> Vec<u64> {
        shape
            .iter()
            .zip(&self.0)
            .map(|(&s, &c)| if c == 0 { 0 } else { s.div_ceil(c) })
            .collect()
    }

    /// Iterate over the blocks this chunk shape cuts `shape` into, in
    /// row-major order. Edge blocks are truncated to the array extent.
    pub fn partition<'a>(&'a self, shape: &'a [u64]) -> Partition<'a> {
        let grid = self.grid(shape);
        let total = if grid.is_empty() {
            0
        } else {
            grid.iter().product()
        };
        Partition {
            shape,
            chunks: &self.0,
            grid,
            next: 0,
            total,
        }
    }

    /// Clamp every extent to the array extent on that axis.
    pub fn clamped(&self, shape: &[u64]) -> Self {
        Self(
            self.0
                .iter()
                .zip(shape)
                .map(|(&c, &s)| c.min(s.max(1)))
                .collect(),
        )
    }
}

impl From<Vec<u64>> for ChunkShape {
    fn from(v: Vec<u64>) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for ChunkShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// A rectangular region of an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub start: Vec<u64>,
    pub shape: Vec<u64>,
}

impl Block {
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Exclusive end coordinate on each axis.
    pub fn end(&self) -> Vec<u64> {
        self.start.iter().zip(&self.shape).map(|(s, n)| s + n).collect()
    }

    /// Convert to a zarrs array subset.
    pub fn to_subset(&self) -> Result<zarrs::array_subset::ArraySubset> {
        zarrs::array_subset::ArraySubset::new_with_start_shape(
            self.start.clone(),
            self.shape.clone(),
        )
        .map_err(RechunkError::zarr)
    }
}

/// Iterator over the blocks of a chunk grid.
pub struct Partition<'a> {
    shape: &'a [u64],
    chunks: &'a [u64],
    grid: Vec<u64>,
    next: u64,
    total: u64,
}

impl Iterator for Partition<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.next >= self.total {
            return None;
        }

        // Unravel the linear index, last axis fastest
        let mut rem = self.next;
        let ndim = self.grid.len();
        let mut start = vec![0u64; ndim];
        let mut shape = vec![0u64; ndim];
        for axis in (0..ndim).rev() {
            let idx = rem % self.grid[axis];
            rem /= self.grid[axis];
            start[axis] = idx * self.chunks[axis];
            shape[axis] = self.chunks[axis].min(self.shape[axis] - start[axis]);
        }

        self.next += 1;
        Some(Block { start, shape })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Partition<'_> {}

/// Shape, chunking and element size of a stored array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayDescriptor {
    pub shape: Vec<u64>,
    pub chunks: ChunkShape,
    /// Bytes per element.
    pub item_size: u64,
}

impl ArrayDescriptor {
    pub fn new(shape: Vec<u64>, chunks: impl Into<ChunkShape>, item_size: u64) -> Result<Self> {
        let chunks = chunks.into();
        if shape.len() != chunks.ndim() {
            return Err(RechunkError::config(format!(
                "chunk shape {} has {} axes but the array has {}",
                chunks,
                chunks.ndim(),
                shape.len()
            )));
        }
        if chunks.0.iter().any(|&c| c == 0) {
            return Err(RechunkError::config(format!(
                "chunk shape {} has a zero extent",
                chunks
            )));
        }
        if item_size == 0 {
            return Err(RechunkError::config("item size must be > 0"));
        }
        Ok(Self {
            shape,
            chunks,
            item_size,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Bytes of one full chunk of `chunks`.
    pub fn chunk_bytes(&self, chunks: &ChunkShape) -> u64 {
        chunks.num_elements() * self.item_size
    }

    pub fn total_bytes(&self) -> u64 {
        self.num_elements() * self.item_size
    }
}
