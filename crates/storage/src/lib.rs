//! Storage layer for the climate-spectra workspace.
//!
//! Provides:
//! - Store configuration for local directories and S3-compatible buckets
//!   (including requester-pays billing)
//! - Opening Zarr stores for the synchronous zarrs API
//! - Output path conventions (`<dataset>/<variable>_{tmp|target}.zarr`)
//! - Store-level operations: existence, explicit clearing, write checks
//! - A URL-addressed dataset catalog

pub mod catalog;
pub mod config;
pub mod error;
pub mod paths;
pub mod store;

pub use catalog::{CatalogDataset, CatalogDocument, DatasetCatalog, DatasetEntry};
pub use config::{ObjectStorageConfig, StoreConfig};
pub use error::{Result, StorageError};
pub use paths::StorePaths;
pub use store::{
    array_exists, clear_prefix, get_object, open_store, check_write, put_object,
    require_writable, WriteCapability, ZarrStore,
};
