//! Frequency bands and band-mean aggregation.
//!
//! A band is a half-open interval `[low, high)` of frequencies in cycles per
//! day. A [`BandTable`] refuses overlapping bands, so no frequency bin is
//! ever counted in two bands; touching bands (`a.high == b.low`) are fine.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SpectralError};
use crate::lazy::SpectralArray;

/// A labelled half-open frequency interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub label: String,
    pub low: f64,
    pub high: f64,
}

impl FrequencyBand {
    pub fn new(label: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            label: label.into(),
            low,
            high,
        }
    }

    /// Band covering periods between `short_days` and `long_days`
    /// (frequencies `[1/long_days, 1/short_days)`).
    pub fn from_periods(label: impl Into<String>, long_days: f64, short_days: f64) -> Self {
        Self::new(label, 1.0 / long_days, 1.0 / short_days)
    }

    pub fn contains(&self, frequency: f64) -> bool {
        frequency >= self.low && frequency < self.high
    }

    pub fn overlaps(&self, other: &FrequencyBand) -> bool {
        self.low < other.high && other.low < self.high
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| SpectralError::InvalidBand {
            label: self.label.clone(),
            reason: reason.to_string(),
        };
        if self.label.trim().is_empty() {
            return Err(invalid("label must not be empty"));
        }
        if !self.low.is_finite() || !self.high.is_finite() {
            return Err(invalid("bounds must be finite"));
        }
        if self.low < 0.0 {
            return Err(invalid("low bound must be >= 0"));
        }
        if self.low >= self.high {
            return Err(invalid("low bound must be below high bound"));
        }
        Ok(())
    }
}

/// What to do when a band selects no frequency bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyBandPolicy {
    /// Produce an all-NaN map and log a warning.
    #[default]
    NoData,
    /// Fail with [`SpectralError::EmptyBand`].
    Error,
}

/// Validated, non-overlapping set of bands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandTable {
    bands: Vec<FrequencyBand>,
}

impl BandTable {
    /// Validate `bands`; order is kept for output.
    pub fn new(bands: Vec<FrequencyBand>) -> Result<Self> {
        for band in &bands {
            band.validate()?;
        }

        let mut sorted: Vec<&FrequencyBand> = bands.iter().collect();
        sorted.sort_by(|a, b| a.low.total_cmp(&b.low));
        for pair in sorted.windows(2) {
            if pair[0].overlaps(pair[1]) {
                return Err(SpectralError::OverlappingBands {
                    first: pair[0].label.clone(),
                    second: pair[1].label.clone(),
                });
            }
        }

        for (i, band) in bands.iter().enumerate() {
            if bands[..i].iter().any(|b| b.label == band.label) {
                return Err(SpectralError::InvalidBand {
                    label: band.label.clone(),
                    reason: "duplicate label".to_string(),
                });
            }
        }

        Ok(Self { bands })
    }

    pub fn bands(&self) -> &[FrequencyBand] {
        &self.bands
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.bands.iter().map(|b| b.label.as_str()).collect()
    }

    /// Band means for every band in table order.
    pub fn aggregate(&self, spectra: &SpectralArray, policy: EmptyBandPolicy) -> Result<Vec<BandMap>> {
        self.bands
            .iter()
            .map(|band| band_mean(spectra, band, policy))
            .collect()
    }
}

/// Mean spectral value of one band at every cell, row-major `[y][x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BandMap {
    pub band: FrequencyBand,
    /// Number of frequency bins averaged.
    pub bins: usize,
    pub ny: usize,
    pub nx: usize,
    pub values: Vec<f32>,
}

impl BandMap {
    pub fn get(&self, y: usize, x: usize) -> f32 {
        self.values[y * self.nx + x]
    }

    /// Mean over cells, ignoring NaN. NaN when every cell is NaN.
    pub fn nan_mean(&self) -> f64 {
        let (sum, count) = self
            .values
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0f64, 0usize), |(s, c), &v| (s + v as f64, c + 1));
        if count == 0 {
            f64::NAN
        } else {
            sum / count as f64
        }
    }

    /// Number of cells holding a value.
    pub fn valid_cells(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }
}

/// Unweighted mean over the bins of `band`, per cell.
///
/// Pure: the same inputs always give the same map.
pub fn band_mean(
    spectra: &SpectralArray,
    band: &FrequencyBand,
    policy: EmptyBandPolicy,
) -> Result<BandMap> {
    let bins: Vec<usize> = spectra
        .frequencies
        .iter()
        .enumerate()
        .filter(|(_, &f)| band.contains(f))
        .map(|(i, _)| i)
        .collect();

    let cells = spectra.num_cells();
    if bins.is_empty() {
        return match policy {
            EmptyBandPolicy::Error => Err(SpectralError::EmptyBand(band.label.clone())),
            EmptyBandPolicy::NoData => {
                warn!(band = %band.label, low = band.low, high = band.high, "Band contains no frequency bins");
                Ok(BandMap {
                    band: band.clone(),
                    bins: 0,
                    ny: spectra.ny,
                    nx: spectra.nx,
                    values: vec![f32::NAN; cells],
                })
            }
        };
    }

    let mut sums = vec![0.0f64; cells];
    for &f in &bins {
        for (sum, &v) in sums.iter_mut().zip(spectra.bin(f)) {
            *sum += v as f64;
        }
    }
    let n = bins.len() as f64;

    Ok(BandMap {
        band: band.clone(),
        bins: bins.len(),
        ny: spectra.ny,
        nx: spectra.nx,
        values: sums.into_iter().map(|s| (s / n) as f32).collect(),
    })
}
