//! Deferred spectra over a chunked `[time, y, x]` array.
//!
//! [`LazySpectrum::open`] only checks preconditions and plans the transform;
//! nothing is read until [`LazySpectrum::materialize`] is called for a
//! region. Work is organised by the array's spatial chunks: each chunk is
//! read whole along time, missing values are filled with zero, spectra are
//! computed in parallel and the result is cached.

use std::ops::Range;
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use zarrs::array::Array;
use zarrs::array_subset::ArraySubset;
use zarrs::storage::ReadableStorageTraits;

use crate::cache::{BlockCache, BlockKey, CacheStats};
use crate::error::{Result, SpectralError};
use crate::prep::fill_missing;
use crate::transform::{PowerSpectrum, SpectrumOptions};

/// Default size of the spectral block cache.
pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;

/// A rectangular selection of the spatial axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub y: Range<usize>,
    pub x: Range<usize>,
}

impl Region {
    pub fn new(y: Range<usize>, x: Range<usize>) -> Self {
        Self { y, x }
    }

    /// The whole `ny × nx` domain.
    pub fn full(ny: usize, nx: usize) -> Self {
        Self { y: 0..ny, x: 0..nx }
    }

    pub fn ny(&self) -> usize {
        self.y.len()
    }

    pub fn nx(&self) -> usize {
        self.x.len()
    }

    pub fn num_cells(&self) -> usize {
        self.ny() * self.nx()
    }

    /// Check the region is non-empty and inside an `ny × nx` domain.
    pub fn validate(&self, ny: usize, nx: usize) -> Result<()> {
        if self.y.is_empty() || self.x.is_empty() {
            return Err(SpectralError::region(format!("{:?} is empty", self)));
        }
        if self.y.end > ny || self.x.end > nx {
            return Err(SpectralError::region(format!(
                "{:?} exceeds the {}×{} domain",
                self, ny, nx
            )));
        }
        Ok(())
    }
}

/// Materialized spectra for a region, frequency-major:
/// `data[(f * ny + y) * nx + x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralArray {
    pub frequencies: Vec<f64>,
    /// Region of the source array the spectra belong to.
    pub region: Region,
    pub ny: usize,
    pub nx: usize,
    pub data: Vec<f32>,
}

impl SpectralArray {
    pub fn new(frequencies: Vec<f64>, region: Region, data: Vec<f32>) -> Result<Self> {
        let (ny, nx) = (region.ny(), region.nx());
        if data.len() != frequencies.len() * ny * nx {
            return Err(SpectralError::shape(format!(
                "{} values for {} bins over {}×{} cells",
                data.len(),
                frequencies.len(),
                ny,
                nx
            )));
        }
        Ok(Self {
            frequencies,
            region,
            ny,
            nx,
            data,
        })
    }

    pub fn num_bins(&self) -> usize {
        self.frequencies.len()
    }

    pub fn num_cells(&self) -> usize {
        self.ny * self.nx
    }

    /// Value of bin `f` at region-relative cell `(y, x)`.
    pub fn get(&self, f: usize, y: usize, x: usize) -> f32 {
        self.data[(f * self.ny + y) * self.nx + x]
    }

    /// Spatial map of bin `f`.
    pub fn bin(&self, f: usize) -> &[f32] {
        let cells = self.num_cells();
        &self.data[f * cells..(f + 1) * cells]
    }

    /// Spectrum of region-relative cell `(y, x)`.
    pub fn spectrum_at(&self, y: usize, x: usize) -> Vec<f32> {
        (0..self.num_bins()).map(|f| self.get(f, y, x)).collect()
    }
}

/// Deferred spectral transform of a `[time, y, x]` array.
pub struct LazySpectrum<TStorage: ?Sized> {
    array: Array<TStorage>,
    transform: PowerSpectrum,
    nt: usize,
    ny: usize,
    nx: usize,
    block_ny: usize,
    block_nx: usize,
    cache: Mutex<BlockCache>,
}

impl<TStorage> LazySpectrum<TStorage>
where
    TStorage: ?Sized + ReadableStorageTraits + 'static,
{
    /// Prepare spectra over `array`.
    ///
    /// The time axis (axis 0) must be stored as a single chunk.
    pub fn open(array: Array<TStorage>, options: SpectrumOptions) -> Result<Self> {
        Self::open_with_cache(array, options, DEFAULT_CACHE_BYTES)
    }

    pub fn open_with_cache(
        array: Array<TStorage>,
        options: SpectrumOptions,
        cache_bytes: usize,
    ) -> Result<Self> {
        let shape = array.shape().to_vec();
        if shape.len() != 3 {
            return Err(SpectralError::shape(format!(
                "expected a [time, y, x] array, got {} dimension(s)",
                shape.len()
            )));
        }

        let origin = vec![0u64; shape.len()];
        let chunks = array
            .chunk_grid()
            .chunk_shape(&origin, array.shape())
            .map_err(SpectralError::zarr)?
            .ok_or_else(|| SpectralError::zarr("array has no regular chunk grid"))?;
        let chunks: Vec<u64> = chunks.iter().map(|c| c.get()).collect();

        if chunks[0] < shape[0] {
            return Err(SpectralError::AxisChunked {
                axis: 0,
                chunk: chunks[0],
                extent: shape[0],
            });
        }

        let nt = shape[0] as usize;
        let transform = PowerSpectrum::new(nt, options)?;

        debug!(
            shape = ?shape,
            chunks = ?chunks,
            bins = transform.num_bins(),
            "Opened lazy spectrum"
        );

        Ok(Self {
            array,
            transform,
            nt,
            ny: shape[1] as usize,
            nx: shape[2] as usize,
            block_ny: (chunks[1] as usize).min(shape[1] as usize).max(1),
            block_nx: (chunks[2] as usize).min(shape[2] as usize).max(1),
            cache: Mutex::new(BlockCache::new(cache_bytes)),
        })
    }

    /// Spatial extent `(ny, nx)`.
    pub fn spatial_shape(&self) -> (usize, usize) {
        (self.ny, self.nx)
    }

    pub fn num_samples(&self) -> usize {
        self.nt
    }

    pub fn frequencies(&self) -> &[f64] {
        self.transform.frequencies()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .lock()
            .map(|cache| cache.stats())
            .unwrap_or_default()
    }

    /// Compute spectra for `region`.
    #[instrument(skip(self), fields(ny = region.ny(), nx = region.nx()))]
    pub fn materialize(&self, region: &Region) -> Result<SpectralArray> {
        region.validate(self.ny, self.nx)?;

        let nf = self.transform.num_bins();
        let (rny, rnx) = (region.ny(), region.nx());
        let mut data = vec![0.0f32; nf * rny * rnx];

        let by_range = region.y.start / self.block_ny..region.y.end.div_ceil(self.block_ny);
        let bx_range = region.x.start / self.block_nx..region.x.end.div_ceil(self.block_nx);

        for by in by_range {
            for bx in bx_range.clone() {
                let (ys, xs) = self.block_bounds(by, bx);
                let block = self.block((by, bx))?;
                let (bny, bnx) = (ys.len(), xs.len());

                // Intersection of the block with the region
                let y0 = ys.start.max(region.y.start);
                let y1 = ys.end.min(region.y.end);
                let x0 = xs.start.max(region.x.start);
                let x1 = xs.end.min(region.x.end);

                for f in 0..nf {
                    for y in y0..y1 {
                        let src = (f * bny + (y - ys.start)) * bnx;
                        let dst = (f * rny + (y - region.y.start)) * rnx;
                        for x in x0..x1 {
                            data[dst + (x - region.x.start)] = block[src + (x - xs.start)];
                        }
                    }
                }
            }
        }

        SpectralArray::new(self.frequencies().to_vec(), region.clone(), data)
    }

    fn block_bounds(&self, by: usize, bx: usize) -> (Range<usize>, Range<usize>) {
        let y0 = by * self.block_ny;
        let x0 = bx * self.block_nx;
        (
            y0..(y0 + self.block_ny).min(self.ny),
            x0..(x0 + self.block_nx).min(self.nx),
        )
    }

    /// Spectra of one spatial block, frequency-major within the block.
    fn block(&self, key: BlockKey) -> Result<Arc<Vec<f32>>> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(block) = cache.get(&key) {
                return Ok(block);
            }
        }

        let block = Arc::new(self.compute_block(key)?);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, block.clone());
        }
        Ok(block)
    }

    fn compute_block(&self, (by, bx): BlockKey) -> Result<Vec<f32>> {
        let (ys, xs) = self.block_bounds(by, bx);
        let (bny, bnx) = (ys.len(), xs.len());
        let cells = bny * bnx;

        let subset = ArraySubset::new_with_start_shape(
            vec![0, ys.start as u64, xs.start as u64],
            vec![self.nt as u64, bny as u64, bnx as u64],
        )
        .map_err(SpectralError::zarr)?;
        let samples: Vec<f32> = self
            .array
            .retrieve_array_subset_elements(&subset)
            .map_err(SpectralError::zarr)?;

        let nt = self.nt;
        let nf = self.transform.num_bins();
        let transform = &self.transform;

        let spectra: Vec<(Vec<f64>, usize)> = (0..cells)
            .into_par_iter()
            .map_init(
                || (transform.scratch(), vec![0.0f64; nt]),
                |(scratch, series), cell| -> Result<(Vec<f64>, usize)> {
                    for (t, v) in series.iter_mut().enumerate() {
                        *v = samples[t * cells + cell] as f64;
                    }
                    let filled = fill_missing(series);
                    let mut out = vec![0.0f64; nf];
                    transform.compute_into(series, scratch, &mut out)?;
                    Ok((out, filled))
                },
            )
            .collect::<Result<_>>()?;

        let mut block = vec![0.0f32; nf * cells];
        let mut filled_total = 0;
        for (cell, (spectrum, filled)) in spectra.into_iter().enumerate() {
            filled_total += filled;
            for (f, p) in spectrum.into_iter().enumerate() {
                block[f * cells + cell] = p as f32;
            }
        }

        info!(
            block_y = by,
            block_x = bx,
            cells,
            filled = filled_total,
            "Computed spectral block"
        );
        Ok(block)
    }
}
