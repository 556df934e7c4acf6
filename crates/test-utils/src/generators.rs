//! Test data generators for synthetic time × lat × lon cubes.
//!
//! All cubes are stored time-major: element `(t, y, x)` lives at
//! `t * ny * nx + y * nx + x`, matching the C order of a Zarr array with
//! shape `[nt, ny, nx]`.

use std::f64::consts::PI;

/// A dense float32 cube with shape `[nt, ny, nx]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cube {
    pub nt: usize,
    pub ny: usize,
    pub nx: usize,
    pub data: Vec<f32>,
}

impl Cube {
    pub fn shape(&self) -> Vec<u64> {
        vec![self.nt as u64, self.ny as u64, self.nx as u64]
    }

    pub fn index(&self, t: usize, y: usize, x: usize) -> usize {
        (t * self.ny + y) * self.nx + x
    }

    pub fn get(&self, t: usize, y: usize, x: usize) -> f32 {
        self.data[self.index(t, y, x)]
    }

    /// Time series of one cell.
    pub fn series(&self, y: usize, x: usize) -> Vec<f32> {
        (0..self.nt).map(|t| self.get(t, y, x)).collect()
    }

    /// Replace `missing_fraction` of the samples of cell `(y, x)` with NaN,
    /// spread evenly over the time axis.
    pub fn punch_gaps(&mut self, y: usize, x: usize, missing_fraction: f64) {
        let missing = ((self.nt as f64) * missing_fraction).round() as usize;
        if missing == 0 {
            return;
        }
        let stride = self.nt as f64 / missing as f64;
        for k in 0..missing {
            let t = ((k as f64) * stride) as usize;
            let i = self.index(t.min(self.nt - 1), y, x);
            self.data[i] = f32::NAN;
        }
    }
}

/// Creates a cube with predictable values.
///
/// Each value is `t * 10000 + y * 100 + x`, so any read can be checked
/// against its coordinates (exact in f32 while `t < 1600`).
///
/// # Example
///
/// ```
/// use test_utils::index_cube;
///
/// let cube = index_cube(3, 2, 4);
/// assert_eq!(cube.data.len(), 24);
/// assert_eq!(cube.get(2, 1, 3), 20103.0);
/// ```
pub fn index_cube(nt: usize, ny: usize, nx: usize) -> Cube {
    let mut data = Vec::with_capacity(nt * ny * nx);
    for t in 0..nt {
        for y in 0..ny {
            for x in 0..nx {
                data.push((t * 10000 + y * 100 + x) as f32);
            }
        }
    }
    Cube { nt, ny, nx, data }
}

/// Creates a cube where every cell holds a sinusoid of `period` samples.
///
/// The amplitude grows with the row index (`amplitude * (1 + y)`) and each
/// cell carries a constant offset, so cells are distinguishable but share
/// the same dominant frequency.
pub fn sinusoid_cube(nt: usize, ny: usize, nx: usize, period: f64, amplitude: f64) -> Cube {
    let mut data = Vec::with_capacity(nt * ny * nx);
    for t in 0..nt {
        let phase = (2.0 * PI * t as f64 / period).sin();
        for y in 0..ny {
            for x in 0..nx {
                let offset = 280.0 + x as f64;
                data.push((offset + amplitude * (1.0 + y as f64) * phase) as f32);
            }
        }
    }
    Cube { nt, ny, nx, data }
}

/// A single sinusoid of `period` samples.
pub fn sinusoid_series(n: usize, period: f64, amplitude: f64) -> Vec<f64> {
    (0..n)
        .map(|t| amplitude * (2.0 * PI * t as f64 / period).sin())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_cube_layout() {
        let cube = index_cube(4, 3, 5);
        assert_eq!(cube.shape(), vec![4, 3, 5]);
        assert_eq!(cube.get(0, 0, 0), 0.0);
        assert_eq!(cube.get(0, 0, 1), 1.0);
        assert_eq!(cube.get(0, 1, 0), 100.0);
        assert_eq!(cube.get(1, 0, 0), 10000.0);
        assert_eq!(cube.data[cube.index(3, 2, 4)], 30204.0);
    }

    #[test]
    fn test_sinusoid_cube_period() {
        let cube = sinusoid_cube(40, 2, 2, 10.0, 1.0);
        let series = cube.series(1, 1);
        assert!((series[0] - series[10]).abs() < 1e-4);
        assert!((series[5] - series[15]).abs() < 1e-4);
    }

    #[test]
    fn test_punch_gaps_fraction() {
        let mut cube = index_cube(100, 2, 2);
        cube.punch_gaps(1, 0, 0.9);
        let missing = cube.series(1, 0).iter().filter(|v| v.is_nan()).count();
        assert_eq!(missing, 90);
        assert!(cube.series(0, 0).iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_sinusoid_series() {
        let s = sinusoid_series(8, 4.0, 2.0);
        assert!((s[1] - 2.0).abs() < 1e-12);
        assert!((s[3] + 2.0).abs() < 1e-12);
    }
}
