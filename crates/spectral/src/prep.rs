//! Series preparation ahead of the transform: missing-value fill, linear
//! detrending and tapering.

use std::f64::consts::PI;

/// Replace NaN samples with zero. Returns the number of replaced samples.
pub fn fill_missing(series: &mut [f64]) -> usize {
    let mut filled = 0;
    for v in series.iter_mut() {
        if v.is_nan() {
            *v = 0.0;
            filled += 1;
        }
    }
    filled
}

/// Subtract the least-squares line through `(i, series[i])`.
///
/// A single sample is reduced to zero.
pub fn detrend_linear(series: &mut [f64]) {
    let n = series.len();
    if n == 0 {
        return;
    }
    if n == 1 {
        series[0] = 0.0;
        return;
    }

    let nf = n as f64;
    let t_mean = (nf - 1.0) / 2.0;
    let y_mean = series.iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var = 0.0;
    for (i, &y) in series.iter().enumerate() {
        let dt = i as f64 - t_mean;
        cov += dt * (y - y_mean);
        var += dt * dt;
    }
    let slope = cov / var;

    for (i, y) in series.iter_mut().enumerate() {
        *y -= y_mean + slope * (i as f64 - t_mean);
    }
}

/// Symmetric Hann window of length `n`: `0.5 - 0.5 cos(2πk / (n - 1))`.
pub fn hann(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (n - 1) as f64;
            (0..n)
                .map(|k| 0.5 - 0.5 * (2.0 * PI * k as f64 / denom).cos())
                .collect()
        }
    }
}

/// Frequencies of the non-negative bins of a real FFT of `n` samples taken
/// `spacing` apart: `k / (n · spacing)` for `k = 0..=n/2`.
pub fn rfft_frequencies(n: usize, spacing: f64) -> Vec<f64> {
    let span = n as f64 * spacing;
    (0..=n / 2).map(|k| k as f64 / span).collect()
}
