//! Chunk-shape negotiation under a memory budget.
//!
//! Converting between two chunk geometries in one pass can require holding
//! far more than a chunk in memory (every source chunk that overlaps a target
//! chunk). The planner picks three shapes instead:
//!
//! - **write** blocks: the target chunks grown (in whole-chunk multiples)
//!   until they hit the budget,
//! - **read** blocks: the source chunks grown along the axes where the write
//!   blocks are larger, also within the budget,
//! - **intermediate** chunks for the staging store, fine enough that every
//!   read block is a whole number of them.
//!
//! Data then flows source → staging in read blocks and staging → target in
//! write blocks. When every read block already covers whole target chunks the
//! staging store is skipped.

use serde::{Deserialize, Serialize};

use crate::error::{RechunkError, Result};
use crate::types::{ArrayDescriptor, ChunkShape};

/// Outcome of chunk negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkNegotiation {
    pub read: ChunkShape,
    pub intermediate: ChunkShape,
    pub write: ChunkShape,
    pub target: ChunkShape,
    /// False when source data can be written straight to the target.
    pub needs_staging: bool,
}

/// Grow `chunks` axis by axis (first axis first) towards `limits`, keeping
/// every extent a multiple of the original chunk and the whole block within
/// `max_mem` bytes.
///
/// Extents are also capped by the array extent; reaching the full extent is
/// allowed even when it is not a multiple of the chunk.
pub fn consolidate_chunks(
    shape: &[u64],
    chunks: &[u64],
    item_size: u64,
    max_mem: u64,
    limits: &[u64],
) -> Result<Vec<u64>> {
    if shape.len() != chunks.len() || shape.len() != limits.len() {
        return Err(RechunkError::config(
            "shape, chunks and limits must have the same rank",
        ));
    }

    let chunk_mem = item_size * chunks.iter().product::<u64>();
    if chunk_mem > max_mem {
        return Err(RechunkError::config(format!(
            "chunk memory ({} bytes) exceeds max_mem ({} bytes)",
            chunk_mem, max_mem
        )));
    }

    let mut grown = chunks.to_vec();
    for axis in 0..shape.len() {
        let base = chunks[axis];
        let limit = limits[axis].min(shape[axis]).max(base);

        let other: u64 = item_size
            * grown
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != axis)
                .map(|(_, &c)| c)
                .product::<u64>();
        let capacity = max_mem / other.max(1);
        if capacity <= base {
            continue;
        }

        let wanted = capacity.min(limit);
        grown[axis] = if wanted >= shape[axis] {
            shape[axis]
        } else {
            (wanted / base * base).max(base)
        };
    }

    Ok(grown)
}

/// Choose read, intermediate and write shapes for rewriting `source` into
/// `target_chunks` without exceeding `max_mem` bytes per task.
///
/// Fails with a configuration error, before any I/O, when a single source or
/// target chunk does not fit in the budget.
pub fn negotiate(
    source: &ArrayDescriptor,
    target_chunks: &ChunkShape,
    max_mem: u64,
) -> Result<ChunkNegotiation> {
    if target_chunks.ndim() != source.ndim() {
        return Err(RechunkError::config(format!(
            "target chunks {} have {} axes but the source array has {}",
            target_chunks,
            target_chunks.ndim(),
            source.ndim()
        )));
    }
    if target_chunks.0.iter().any(|&c| c == 0) {
        return Err(RechunkError::config(format!(
            "target chunks {} have a zero extent",
            target_chunks
        )));
    }

    let shape = &source.shape;
    let source_chunks = source.chunks.clamped(shape);
    let target = target_chunks.clamped(shape);

    let source_mem = source.chunk_bytes(&source_chunks);
    if source_mem > max_mem {
        return Err(RechunkError::config(format!(
            "memory budget of {} bytes is smaller than one source chunk {} ({} bytes)",
            max_mem, source_chunks, source_mem
        )));
    }

    let target_mem = source.chunk_bytes(&target);
    if target_mem > max_mem {
        return Err(RechunkError::config(format!(
            "memory budget of {} bytes is smaller than one target chunk {} ({} bytes)",
            max_mem, target, target_mem
        )));
    }

    let write = consolidate_chunks(shape, &target.0, source.item_size, max_mem, shape)?;

    let read_limits: Vec<u64> = source_chunks
        .0
        .iter()
        .zip(&write)
        .map(|(&s, &w)| if w > s { w } else { s })
        .collect();
    let read = consolidate_chunks(
        shape,
        &source_chunks.0,
        source.item_size,
        max_mem,
        &read_limits,
    )?;

    let intermediate: Vec<u64> = read
        .iter()
        .zip(&write)
        .map(|(&r, &w)| if w >= r { r } else { gcd(r, w) })
        .collect();

    let needs_staging = read
        .iter()
        .zip(&target.0)
        .zip(shape)
        .any(|((&r, &t), &s)| r % t != 0 && r < s);

    Ok(ChunkNegotiation {
        read: ChunkShape(read),
        intermediate: ChunkShape(intermediate),
        write: ChunkShape(write),
        target,
        needs_staging,
    })
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(v: &[u64]) -> u64 {
        v.iter().product()
    }

    #[test]
    fn test_consolidate_respects_budget_and_multiples() {
        let grown = consolidate_chunks(&[100, 40, 40], &[1, 40, 40], 4, 64_000, &[100, 40, 40])
            .unwrap();
        // 40*40*4 = 6400 bytes per time step -> 10 steps fit
        assert_eq!(grown, vec![10, 40, 40]);
        assert!(product(&grown) * 4 <= 64_000);
    }

    #[test]
    fn test_consolidate_stops_at_limit() {
        let grown = consolidate_chunks(&[100, 40, 40], &[1, 40, 40], 4, 1_000_000, &[7, 40, 40])
            .unwrap();
        assert_eq!(grown, vec![7, 40, 40]);
    }

    #[test]
    fn test_consolidate_rejects_oversized_chunk() {
        assert!(consolidate_chunks(&[10, 10], &[10, 10], 4, 100, &[10, 10]).is_err());
    }

    #[test]
    fn test_budget_smaller_than_target_chunk_is_config_error() {
        let source = ArrayDescriptor::new(vec![3650, 180, 360], vec![1, 180, 360], 4).unwrap();
        let target = ChunkShape::new(vec![1825, 90, 180]);
        // One target chunk is 1825*90*180*4 = 118_260_000 bytes
        let err = negotiate(&source, &target, 100_000_000).unwrap_err();
        assert!(matches!(err, RechunkError::Config(_)));
        assert!(err.to_string().contains("target chunk"));
    }

    #[test]
    fn test_budget_smaller_than_source_chunk_is_config_error() {
        let source = ArrayDescriptor::new(vec![100, 100, 100], vec![100, 100, 100], 4).unwrap();
        let target = ChunkShape::new(vec![10, 10, 10]);
        assert!(matches!(
            negotiate(&source, &target, 1_000_000),
            Err(RechunkError::Config(_))
        ));
    }

    #[test]
    fn test_rank_mismatch_is_config_error() {
        let source = ArrayDescriptor::new(vec![100, 10], vec![1, 10], 4).unwrap();
        assert!(negotiate(&source, &ChunkShape::new(vec![100]), 1 << 20).is_err());
        assert!(negotiate(&source, &ChunkShape::new(vec![100, 0]), 1 << 20).is_err());
    }

    #[test]
    fn test_time_to_space_negotiation() {
        // Chunked in time, contiguous in space -> contiguous in time, chunked in space
        let source = ArrayDescriptor::new(vec![730, 20, 40], vec![5, 20, 40], 4).unwrap();
        let target = ChunkShape::new(vec![730, 10, 10]);
        let max_mem = 400_000;

        let plan = negotiate(&source, &target, max_mem).unwrap();

        for shape in [&plan.read, &plan.write] {
            assert!(source.chunk_bytes(shape) <= max_mem, "{} over budget", shape);
        }
        // Every read block must be a whole number of intermediate chunks
        for ((&r, &i), &s) in plan.read.0.iter().zip(&plan.intermediate.0).zip(&source.shape) {
            assert!(r % i == 0 || r >= s);
        }
        // Write blocks are whole target chunks
        for ((&w, &t), &s) in plan.write.0.iter().zip(&plan.target.0).zip(&source.shape) {
            assert!(w % t == 0 || w == s);
        }
        assert!(plan.needs_staging);
    }

    #[test]
    fn test_compatible_geometry_skips_staging() {
        let source = ArrayDescriptor::new(vec![100, 20, 20], vec![50, 20, 20], 4).unwrap();
        let target = ChunkShape::new(vec![50, 10, 10]);
        let plan = negotiate(&source, &target, 1_000_000).unwrap();
        assert!(!plan.needs_staging);
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(7, 3), 1);
        assert_eq!(gcd(10, 5), 5);
    }
}
