//! Power spectra of real-valued series.
//!
//! The transform runs in "real input" mode: only the `n/2 + 1` non-negative
//! frequency bins are computed, and power is reported as a one-sided
//! spectral density
//!
//! ```text
//! P_k = c_k · |X_k|² · Δt / Σ w²
//! ```
//!
//! where `X` is the FFT of the (detrended, windowed) series, `w` the window
//! and `c_k` is 2 for every bin except DC and, for even `n`, Nyquist. With
//! this scaling `Σ P_k · Δf` equals the window-weighted variance of the
//! series.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SpectralError};
use crate::prep::{detrend_linear, hann, rfft_frequencies};

/// Trend removal applied before the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detrend {
    None,
    #[default]
    Linear,
}

/// How bins are turned into the reported value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    /// Squared magnitude, scaled as a one-sided density.
    #[default]
    Power,
    /// Unscaled real part of the FFT output. Not a power estimate; only for
    /// comparison with results produced that way.
    RealPartProxy,
}

/// Options of the spectral transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumOptions {
    #[serde(default)]
    pub detrend: Detrend,
    /// Apply a Hann taper.
    #[serde(default = "default_window")]
    pub window: bool,
    #[serde(default)]
    pub estimator: Estimator,
    /// Sample spacing along the transform axis, in days.
    #[serde(default = "default_spacing")]
    pub spacing_days: f64,
}

fn default_window() -> bool {
    true
}

fn default_spacing() -> f64 {
    1.0
}

impl Default for SpectrumOptions {
    fn default() -> Self {
        Self {
            detrend: Detrend::Linear,
            window: true,
            estimator: Estimator::Power,
            spacing_days: 1.0,
        }
    }
}

/// Per-thread working buffers for [`PowerSpectrum::compute_into`].
pub struct Scratch {
    input: Vec<f64>,
    output: Vec<Complex<f64>>,
    fft: Vec<Complex<f64>>,
}

/// Planned spectral transform for series of one length.
#[derive(Clone)]
pub struct PowerSpectrum {
    len: usize,
    options: SpectrumOptions,
    window: Option<Vec<f64>>,
    window_power: f64,
    frequencies: Vec<f64>,
    fft: Arc<dyn RealToComplex<f64>>,
}

impl std::fmt::Debug for PowerSpectrum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerSpectrum")
            .field("len", &self.len)
            .field("options", &self.options)
            .finish()
    }
}

impl PowerSpectrum {
    /// Plan the transform of series with `len` samples.
    pub fn new(len: usize, options: SpectrumOptions) -> Result<Self> {
        if len < 2 {
            return Err(SpectralError::shape(format!(
                "a spectrum needs at least 2 samples, got {}",
                len
            )));
        }
        // A 2-point Hann taper is all zeros
        if options.window && len < 3 {
            return Err(SpectralError::shape(format!(
                "a tapered spectrum needs at least 3 samples, got {}",
                len
            )));
        }
        if !(options.spacing_days > 0.0 && options.spacing_days.is_finite()) {
            return Err(SpectralError::shape(format!(
                "sample spacing must be positive, got {}",
                options.spacing_days
            )));
        }
        if options.estimator == Estimator::RealPartProxy {
            warn!("Using the real part of the FFT as a power proxy; values are not a power spectrum");
        }

        let window = options.window.then(|| hann(len));
        let window_power = match &window {
            Some(w) => w.iter().map(|v| v * v).sum(),
            None => len as f64,
        };

        let mut planner = RealFftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(len);

        Ok(Self {
            len,
            frequencies: rfft_frequencies(len, options.spacing_days),
            options,
            window,
            window_power,
            fft,
        })
    }

    /// Number of input samples.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of output bins (`len / 2 + 1`).
    pub fn num_bins(&self) -> usize {
        self.frequencies.len()
    }

    /// Bin frequencies in cycles per day.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn options(&self) -> &SpectrumOptions {
        &self.options
    }

    pub fn scratch(&self) -> Scratch {
        Scratch {
            input: self.fft.make_input_vec(),
            output: self.fft.make_output_vec(),
            fft: self.fft.make_scratch_vec(),
        }
    }

    /// Spectrum of one series.
    pub fn compute(&self, series: &[f64]) -> Result<Vec<f64>> {
        let mut scratch = self.scratch();
        let mut out = vec![0.0; self.num_bins()];
        self.compute_into(series, &mut scratch, &mut out)?;
        Ok(out)
    }

    /// Spectrum of one series written into `out`, reusing `scratch`.
    ///
    /// Rejects series containing NaN.
    pub fn compute_into(&self, series: &[f64], scratch: &mut Scratch, out: &mut [f64]) -> Result<()> {
        if series.len() != self.len {
            return Err(SpectralError::shape(format!(
                "series has {} samples, transform was planned for {}",
                series.len(),
                self.len
            )));
        }
        if out.len() != self.num_bins() {
            return Err(SpectralError::shape(format!(
                "output has {} bins, expected {}",
                out.len(),
                self.num_bins()
            )));
        }
        let undefined = series.iter().filter(|v| v.is_nan()).count();
        if undefined > 0 {
            return Err(SpectralError::UndefinedValues { count: undefined });
        }

        scratch.input.copy_from_slice(series);
        if self.options.detrend == Detrend::Linear {
            detrend_linear(&mut scratch.input);
        }
        if let Some(window) = &self.window {
            for (x, w) in scratch.input.iter_mut().zip(window) {
                *x *= w;
            }
        }

        self.fft
            .process_with_scratch(&mut scratch.input, &mut scratch.output, &mut scratch.fft)
            .map_err(|e| SpectralError::Fft(e.to_string()))?;

        match self.options.estimator {
            Estimator::Power => {
                let scale = self.options.spacing_days / self.window_power;
                let nyquist = (self.len % 2 == 0).then_some(self.len / 2);
                for (k, (o, x)) in out.iter_mut().zip(&scratch.output).enumerate() {
                    let one_sided = if k == 0 || Some(k) == nyquist { 1.0 } else { 2.0 };
                    *o = one_sided * x.norm_sqr() * scale;
                }
            }
            Estimator::RealPartProxy => {
                for (o, x) in out.iter_mut().zip(&scratch.output) {
                    *o = x.re;
                }
            }
        }

        Ok(())
    }
}
