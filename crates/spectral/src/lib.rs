//! Power spectra for chunked climate arrays.
//!
//! Provides:
//! - Series preparation (missing-value fill, linear detrend, Hann taper)
//! - A real-input FFT power spectrum with one-sided density scaling
//! - [`LazySpectrum`]: deferred per-cell spectra over a `[time, y, x]` Zarr
//!   array whose time axis is a single chunk, computed block by block
//! - Frequency bands, band means and validity masks for presentation
//!
//! # Example
//!
//! ```ignore
//! use spectral::{BandTable, EmptyBandPolicy, FrequencyBand, LazySpectrum, Region, SpectrumOptions};
//!
//! let lazy = LazySpectrum::open(target_array, SpectrumOptions::default())?;
//! let spectra = lazy.materialize(&Region::new(0..90, 0..180))?;
//! let bands = BandTable::new(vec![FrequencyBand::from_periods("annual", 500.0, 250.0)])?;
//! let maps = bands.aggregate(&spectra, EmptyBandPolicy::NoData)?;
//! ```

pub mod bands;
pub mod cache;
pub mod error;
pub mod lazy;
pub mod mask;
pub mod prep;
pub mod transform;

pub use bands::{band_mean, BandMap, BandTable, EmptyBandPolicy, FrequencyBand};
pub use cache::{BlockCache, CacheStats};
pub use error::{Result, SpectralError};
pub use lazy::{LazySpectrum, Region, SpectralArray};
pub use mask::{regional_mean_spectrum, RegionalSpectrum, ValidityMask};
pub use prep::{detrend_linear, fill_missing, hann, rfft_frequencies};
pub use transform::{Detrend, Estimator, PowerSpectrum, SpectrumOptions};
