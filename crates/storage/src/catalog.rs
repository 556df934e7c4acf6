//! Dataset catalog.
//!
//! A catalog is a JSON document, addressed by URL, that maps dataset
//! identifiers to the store holding them:
//!
//! ```json
//! {
//!   "datasets": {
//!     "noaa-oisst-avhrr-only": {
//!       "store": { "type": "object_store", "endpoint": "...", "bucket": "pangeo", "requester_pays": true },
//!       "path": "/noaa_oisst/v2.1-avhrr.zarr",
//!       "variables": ["sst"],
//!       "time_step_days": 1.0
//!     }
//!   }
//! }
//! ```
//!
//! Each variable is a Zarr array below `path`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::StoreConfig;
use crate::error::{Result, StorageError};

/// Raw catalog document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub description: String,
    pub datasets: BTreeMap<String, CatalogDataset>,
}

/// One dataset listed in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDataset {
    pub store: StoreConfig,
    /// Group path of the dataset inside the store.
    pub path: String,
    pub variables: Vec<String>,
    /// Sampling interval along time, in days.
    #[serde(default = "default_time_step")]
    pub time_step_days: f64,
}

fn default_time_step() -> f64 {
    1.0
}

/// A resolved dataset variable, ready to be opened.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetEntry {
    pub id: String,
    pub variable: String,
    pub store: StoreConfig,
    /// Zarr array path of the variable.
    pub array_path: String,
    pub time_step_days: f64,
}

/// Dataset catalog loaded from a URL or local file.
#[derive(Debug, Clone)]
pub struct DatasetCatalog {
    source: String,
    document: CatalogDocument,
}

impl DatasetCatalog {
    /// Build a catalog from an already parsed document.
    pub fn from_document(source: impl Into<String>, document: CatalogDocument) -> Self {
        Self {
            source: source.into(),
            document,
        }
    }

    /// Load a catalog from `http(s)://` URLs, `file://` URLs or plain paths.
    #[instrument]
    pub async fn load(url: &str) -> Result<Self> {
        let body = if url.starts_with("http://") || url.starts_with("https://") {
            let response = reqwest::get(url)
                .await
                .map_err(|e| StorageError::catalog(format!("GET {} failed: {}", url, e)))?
                .error_for_status()
                .map_err(|e| StorageError::catalog(format!("GET {} failed: {}", url, e)))?;
            response
                .text()
                .await
                .map_err(|e| StorageError::catalog(format!("reading {} failed: {}", url, e)))?
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            tokio::fs::read_to_string(Path::new(path))
                .await
                .map_err(|e| StorageError::catalog(format!("reading {} failed: {}", path, e)))?
        };

        let document: CatalogDocument = serde_json::from_str(&body)?;
        info!(
            source = %url,
            datasets = document.datasets.len(),
            "Loaded dataset catalog"
        );

        Ok(Self::from_document(url, document))
    }

    /// Where the catalog was loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Dataset identifiers, in sorted order.
    pub fn dataset_ids(&self) -> impl Iterator<Item = &str> {
        self.document.datasets.keys().map(String::as_str)
    }

    /// Resolve a dataset identifier and variable to a store location.
    pub fn resolve(&self, id: &str, variable: &str) -> Result<DatasetEntry> {
        let dataset = self
            .document
            .datasets
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if !dataset.variables.iter().any(|v| v == variable) {
            return Err(StorageError::UnknownVariable {
                dataset: id.to_string(),
                variable: variable.to_string(),
            });
        }

        let group = dataset.path.trim_end_matches('/');
        let array_path = if group.is_empty() {
            format!("/{}", variable)
        } else {
            format!("{}/{}", group, variable)
        };

        debug!(dataset = %id, variable = %variable, path = %array_path, "Resolved dataset");

        Ok(DatasetEntry {
            id: id.to_string(),
            variable: variable.to_string(),
            store: dataset.store.clone(),
            array_path,
            time_step_days: dataset.time_step_days,
        })
    }
}
