//! Validity masks from the fraction of non-missing source samples.

use std::ops::Range;

use serde::Serialize;

use crate::bands::BandMap;
use crate::error::{Result, SpectralError};
use crate::lazy::{Region, SpectralArray};

/// Fraction of valid samples a cell must exceed to be kept.
pub const DEFAULT_THRESHOLD: f64 = 0.2;

/// Per-cell validity, computed on a grid coarsened by `coarsen`.
///
/// A coarse cell is valid when the fraction of non-NaN samples over all time
/// steps and all fine cells it covers is strictly greater than `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidityMask {
    pub ny: usize,
    pub nx: usize,
    pub coarsen: usize,
    pub threshold: f64,
    /// Valid fraction per coarse cell, row-major.
    pub fractions: Vec<f64>,
}

impl ValidityMask {
    /// Build a mask from time-major samples (`samples[(t * ny + y) * nx + x]`).
    pub fn from_samples(
        samples: &[f32],
        nt: usize,
        ny: usize,
        nx: usize,
        coarsen: usize,
        threshold: f64,
    ) -> Result<Self> {
        if samples.len() != nt * ny * nx {
            return Err(SpectralError::shape(format!(
                "{} samples for a {}×{}×{} cube",
                samples.len(),
                nt,
                ny,
                nx
            )));
        }
        if coarsen == 0 {
            return Err(SpectralError::shape("coarsening factor must be >= 1"));
        }
        if !(0.0..1.0).contains(&threshold) {
            return Err(SpectralError::shape(format!(
                "threshold must be in [0, 1), got {}",
                threshold
            )));
        }

        let (cny, cnx) = (ny.div_ceil(coarsen), nx.div_ceil(coarsen));
        let mut valid = vec![0usize; cny * cnx];
        let mut total = vec![0usize; cny * cnx];

        for t in 0..nt {
            for y in 0..ny {
                let row = &samples[(t * ny + y) * nx..(t * ny + y + 1) * nx];
                let cy = y / coarsen;
                for (x, v) in row.iter().enumerate() {
                    let c = cy * cnx + x / coarsen;
                    total[c] += 1;
                    if !v.is_nan() {
                        valid[c] += 1;
                    }
                }
            }
        }

        let fractions = valid
            .iter()
            .zip(&total)
            .map(|(&v, &t)| if t == 0 { 0.0 } else { v as f64 / t as f64 })
            .collect();

        Ok(Self {
            ny,
            nx,
            coarsen,
            threshold,
            fractions,
        })
    }

    /// Shape of the coarse grid.
    pub fn coarse_shape(&self) -> (usize, usize) {
        (self.ny.div_ceil(self.coarsen), self.nx.div_ceil(self.coarsen))
    }

    /// Valid fraction of the coarse cell containing fine cell `(y, x)`.
    pub fn fraction(&self, y: usize, x: usize) -> f64 {
        let (_, cnx) = self.coarse_shape();
        self.fractions[(y / self.coarsen) * cnx + x / self.coarsen]
    }

    /// Validity of fine cell `(y, x)`.
    pub fn is_valid(&self, y: usize, x: usize) -> bool {
        self.fraction(y, x) > self.threshold
    }

    /// Fine-resolution mask over `y × x`, each cell carrying the fraction of
    /// the coarse cell it falls in.
    ///
    /// Masks built over a box whose origin is a multiple of `coarsen` keep
    /// their coarse cells aligned with the grid they were cut from.
    pub fn window(&self, y: Range<usize>, x: Range<usize>) -> Result<ValidityMask> {
        if y.is_empty() || x.is_empty() || y.end > self.ny || x.end > self.nx {
            return Err(SpectralError::shape(format!(
                "window [{}..{}, {}..{}] outside a {}×{} mask",
                y.start, y.end, x.start, x.end, self.ny, self.nx
            )));
        }
        let fractions = y
            .clone()
            .flat_map(|yy| x.clone().map(move |xx| (yy, xx)))
            .map(|(yy, xx)| self.fraction(yy, xx))
            .collect();

        Ok(ValidityMask {
            ny: y.len(),
            nx: x.len(),
            coarsen: 1,
            threshold: self.threshold,
            fractions,
        })
    }

    pub fn valid_cells(&self) -> usize {
        (0..self.ny)
            .flat_map(|y| (0..self.nx).map(move |x| (y, x)))
            .filter(|&(y, x)| self.is_valid(y, x))
            .count()
    }

    /// Write NaN into every invalid cell of `map`. Returns the number of
    /// cells masked.
    ///
    /// `map` may be at full resolution or already coarsened by the mask's
    /// factor.
    pub fn apply(&self, map: &mut BandMap) -> Result<usize> {
        let (cny, cnx) = self.coarse_shape();
        let mut masked = 0;

        if (map.ny, map.nx) == (self.ny, self.nx) {
            for y in 0..self.ny {
                for x in 0..self.nx {
                    if !self.is_valid(y, x) {
                        map.values[y * self.nx + x] = f32::NAN;
                        masked += 1;
                    }
                }
            }
        } else if (map.ny, map.nx) == (cny, cnx) {
            for (value, fraction) in map.values.iter_mut().zip(&self.fractions) {
                if *fraction <= self.threshold {
                    *value = f32::NAN;
                    masked += 1;
                }
            }
        } else {
            return Err(SpectralError::shape(format!(
                "map is {}×{}, mask is {}×{} (coarse {}×{})",
                map.ny, map.nx, self.ny, self.nx, cny, cnx
            )));
        }

        Ok(masked)
    }
}

/// Spatial mean spectrum of a region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionalSpectrum {
    pub frequencies: Vec<f64>,
    pub mean: Vec<f64>,
    /// Cells that contributed.
    pub cells: usize,
}

/// NaN-aware mean spectrum over `region` (coordinates relative to
/// `spectra`), skipping cells the mask marks invalid.
pub fn regional_mean_spectrum(
    spectra: &SpectralArray,
    region: &Region,
    mask: Option<&ValidityMask>,
) -> Result<RegionalSpectrum> {
    region.validate(spectra.ny, spectra.nx)?;
    if let Some(mask) = mask {
        if (mask.ny, mask.nx) != (spectra.ny, spectra.nx) {
            return Err(SpectralError::shape(format!(
                "mask is {}×{}, spectra are {}×{}",
                mask.ny, mask.nx, spectra.ny, spectra.nx
            )));
        }
    }

    let cells: Vec<(usize, usize)> = region
        .y
        .clone()
        .flat_map(|y| region.x.clone().map(move |x| (y, x)))
        .filter(|&(y, x)| mask.map_or(true, |m| m.is_valid(y, x)))
        .collect();

    let mean = (0..spectra.num_bins())
        .map(|f| {
            let (sum, count) = cells
                .iter()
                .map(|&(y, x)| spectra.get(f, y, x))
                .filter(|v| !v.is_nan())
                .fold((0.0f64, 0usize), |(s, c), v| (s + v as f64, c + 1));
            if count == 0 {
                f64::NAN
            } else {
                sum / count as f64
            }
        })
        .collect();

    Ok(RegionalSpectrum {
        frequencies: spectra.frequencies.clone(),
        mean,
        cells: cells.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bands::FrequencyBand;

    fn map(ny: usize, nx: usize, values: Vec<f32>) -> BandMap {
        BandMap {
            band: FrequencyBand::new("b", 0.0, 1.0),
            bins: 1,
            ny,
            nx,
            values,
        }
    }

    /// 10 time steps over a 1×2 grid; cell (0, 0) has `valid_steps` values.
    fn samples(valid_steps: usize) -> Vec<f32> {
        let mut s = Vec::new();
        for t in 0..10 {
            s.push(if t < valid_steps { 1.0 } else { f32::NAN });
            s.push(2.0);
        }
        s
    }

    #[test]
    fn test_sparse_cell_is_masked_regardless_of_value() {
        // 10% valid < 20% threshold
        let mask = ValidityMask::from_samples(&samples(1), 10, 1, 2, 1, DEFAULT_THRESHOLD).unwrap();
        assert!((mask.fraction(0, 0) - 0.1).abs() < 1e-12);
        assert!(!mask.is_valid(0, 0));
        assert!(mask.is_valid(0, 1));

        let mut m = map(1, 2, vec![1e6, 3.0]);
        assert_eq!(mask.apply(&mut m).unwrap(), 1);
        assert!(m.values[0].is_nan());
        assert_eq!(m.values[1], 3.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        // Exactly 20% valid is not enough
        let mask = ValidityMask::from_samples(&samples(2), 10, 1, 2, 1, 0.2).unwrap();
        assert!(!mask.is_valid(0, 0));
        let mask = ValidityMask::from_samples(&samples(3), 10, 1, 2, 1, 0.2).unwrap();
        assert!(mask.is_valid(0, 0));
    }

    #[test]
    fn test_coarsened_mask() {
        // Coarsening 1×2 into one cell: (1 + 10) / 20 valid
        let mask = ValidityMask::from_samples(&samples(1), 10, 1, 2, 2, 0.2).unwrap();
        assert_eq!(mask.coarse_shape(), (1, 1));
        assert!((mask.fractions[0] - 0.55).abs() < 1e-12);
        assert_eq!(mask.valid_cells(), 2);

        let mut coarse = map(1, 1, vec![4.0]);
        assert_eq!(mask.apply(&mut coarse).unwrap(), 0);
        let mut wrong = map(3, 3, vec![0.0; 9]);
        assert!(mask.apply(&mut wrong).is_err());
    }

    #[test]
    fn test_mask_rejects_bad_input() {
        assert!(ValidityMask::from_samples(&[1.0; 5], 10, 1, 2, 1, 0.2).is_err());
        assert!(ValidityMask::from_samples(&samples(1), 10, 1, 2, 0, 0.2).is_err());
        assert!(ValidityMask::from_samples(&samples(1), 10, 1, 2, 1, 1.5).is_err());
    }

    #[test]
    fn test_window_keeps_coarse_alignment() {
        // 1×4 grid coarsened by 2: cells 0-1 fully valid, cells 2-3 half valid
        let mut s = Vec::new();
        for t in 0..10 {
            s.extend([1.0, 1.0, 1.0]);
            s.push(if t < 5 { 1.0 } else { f32::NAN });
        }
        let mask = ValidityMask::from_samples(&s, 10, 1, 4, 2, 0.8).unwrap();
        assert_eq!(mask.valid_cells(), 2);

        let w = mask.window(0..1, 1..4).unwrap();
        assert_eq!((w.ny, w.nx, w.coarsen), (1, 3, 1));
        assert_eq!(w.fractions, vec![1.0, 0.75, 0.75]);
        assert!(w.is_valid(0, 0));
        assert!(!w.is_valid(0, 1));
        assert_eq!(w.valid_cells(), 1);

        assert!(mask.window(0..1, 2..5).is_err());
        assert!(mask.window(0..0, 0..4).is_err());
    }

    #[test]
    fn test_regional_mean_spectrum_skips_masked_cells() {
        let frequencies = vec![0.0, 0.5];
        // Bin 0 then bin 1, each over a 1×2 grid
        let spectra = SpectralArray::new(
            frequencies,
            Region::full(1, 2),
            vec![1.0, 100.0, 2.0, 200.0],
        )
        .unwrap();

        let all = regional_mean_spectrum(&spectra, &Region::full(1, 2), None).unwrap();
        assert_eq!(all.mean, vec![50.5, 101.0]);
        assert_eq!(all.cells, 2);

        let mask = ValidityMask::from_samples(&samples(1), 10, 1, 2, 1, 0.2).unwrap();
        let masked = regional_mean_spectrum(&spectra, &Region::full(1, 2), Some(&mask)).unwrap();
        assert_eq!(masked.mean, vec![100.0, 200.0]);
        assert_eq!(masked.cells, 1);
    }
}
