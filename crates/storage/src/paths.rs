//! Store path conventions for workflow outputs.
//!
//! All outputs of one dataset/variable pair live side by side:
//!
//! ```text
//! <bucket>/<dataset>/<variable>_tmp.zarr      staging store (transient)
//! <bucket>/<dataset>/<variable>_target.zarr   rechunked target store
//! <bucket>/<dataset>/<variable>_bands.zarr    band-averaged maps
//! <bucket>/<dataset>/<variable>_report.json   regional spectra
//! ```
//!
//! The bucket is the store root, so paths here start at the dataset.

use serde::{Deserialize, Serialize};

/// Output locations for one dataset variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePaths {
    pub dataset: String,
    pub variable: String,
}

impl StorePaths {
    pub fn new(dataset: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            dataset: sanitize(&dataset.into()),
            variable: sanitize(&variable.into()),
        }
    }

    fn node(&self, suffix: &str) -> String {
        format!("/{}/{}_{}", self.dataset, self.variable, suffix)
    }

    /// Staging (intermediate) array path.
    pub fn staging(&self) -> String {
        self.node("tmp.zarr")
    }

    /// Rechunked target array path.
    pub fn target(&self) -> String {
        self.node("target.zarr")
    }

    /// Band-map output array path.
    pub fn bands(&self) -> String {
        self.node("bands.zarr")
    }

    /// Report key (relative, no leading slash).
    pub fn report_key(&self) -> String {
        format!("{}/{}_report.json", self.dataset, self.variable)
    }
}

/// Dataset identifiers often contain dots and slashes; keep them readable but
/// path-safe.
fn sanitize(name: &str) -> String {
    name.trim_matches('/')
        .chars()
        .map(|c| match c {
            '/' | ' ' | ':' => '_',
            c => c,
        })
        .collect()
}
