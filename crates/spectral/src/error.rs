//! Error types for spectral processing.

use thiserror::Error;

/// Errors that can occur while computing or aggregating spectra.
#[derive(Error, Debug)]
pub enum SpectralError {
    /// The transform axis is split over several chunks.
    #[error("axis {axis} is chunked ({chunk} of {extent}); rechunk it into a single chunk first")]
    AxisChunked { axis: usize, chunk: u64, extent: u64 },

    /// Input still contains missing values.
    #[error("input contains {count} undefined value(s); fill missing values first")]
    UndefinedValues { count: usize },

    /// Two bands share part of their frequency interval.
    #[error("frequency bands '{first}' and '{second}' overlap")]
    OverlappingBands { first: String, second: String },

    /// A band definition is unusable on its own.
    #[error("invalid frequency band '{label}': {reason}")]
    InvalidBand { label: String, reason: String },

    /// A band selects no frequency bins.
    #[error("frequency band '{0}' contains no frequency bins")]
    EmptyBand(String),

    /// Shapes or lengths do not line up.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A region is empty or outside the array.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// FFT planning or execution error.
    #[error("FFT error: {0}")]
    Fft(String),

    /// Zarr read error.
    #[error("Zarr error: {0}")]
    Zarr(String),
}

impl SpectralError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn region(msg: impl Into<String>) -> Self {
        Self::InvalidRegion(msg.into())
    }

    pub fn zarr(msg: impl ToString) -> Self {
        Self::Zarr(msg.to_string())
    }
}

/// Result type for spectral operations.
pub type Result<T> = std::result::Result<T, SpectralError>;
