//! Opening Zarr stores and the handful of store-level operations the
//! workflow needs: existence checks, prefix clearing and write checks.

use std::sync::Arc;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::ClientOptions;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, info, warn};
use zarrs::storage::{ReadableWritableListableStorage, StoreKey, StorePrefix};
use zarrs_filesystem::FilesystemStore;
use zarrs_object_store::AsyncObjectStore;
use zarrs_storage::storage_adapter::async_to_sync::{
    AsyncToSyncBlockOn, AsyncToSyncStorageAdapter,
};

use crate::config::{ObjectStorageConfig, StoreConfig};
use crate::error::{Result, StorageError};

/// Shared handle to a readable, writable and listable Zarr store.
pub type ZarrStore = ReadableWritableListableStorage;

/// Name of the key written by [`check_write`].
const CHECK_KEY: &str = ".write_check";

/// Blocking executor that works from within a tokio runtime.
///
/// Uses `tokio::task::block_in_place` to move the current task to a blocking
/// thread, then uses the runtime handle to drive the future. Requires the
/// multi-threaded runtime.
#[derive(Clone, Copy)]
pub struct TokioBlockOn;

impl AsyncToSyncBlockOn for TokioBlockOn {
    fn block_on<F: core::future::Future>(&self, future: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
    }
}

/// Storage type for object-store-backed Zarr access (sync adapter).
pub type ObjectZarrStore =
    AsyncToSyncStorageAdapter<AsyncObjectStore<object_store::aws::AmazonS3>, TokioBlockOn>;

/// Open the store described by `config`.
///
/// Filesystem roots are created when missing.
pub fn open_store(config: &StoreConfig) -> Result<ZarrStore> {
    config.validate()?;
    match config {
        StoreConfig::Filesystem { root } => {
            std::fs::create_dir_all(root)?;
            let store = FilesystemStore::new(root)
                .map_err(|e| StorageError::open_failed(format!("{}: {}", root.display(), e)))?;
            debug!(root = %root.display(), "Opened filesystem store");
            Ok(Arc::new(store))
        }
        StoreConfig::ObjectStore(cfg) => Ok(Arc::new(create_object_store(cfg)?)),
    }
}

/// Create an S3-compatible storage backend for Zarr access.
///
/// The object_store client is wrapped in `AsyncObjectStore` and then in an
/// async-to-sync adapter so it can be used with the synchronous zarrs API.
pub fn create_object_store(config: &ObjectStorageConfig) -> Result<ObjectZarrStore> {
    let mut options = ClientOptions::new().with_allow_http(config.allow_http);

    if config.requester_pays {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-request-payer", HeaderValue::from_static("requester"));
        options = options.with_default_headers(headers);
    }

    let mut builder = AmazonS3Builder::new()
        .with_endpoint(&config.endpoint)
        .with_bucket_name(&config.bucket)
        .with_region(&config.region)
        .with_client_options(options);

    // Anonymous access for public buckets
    if !config.access_key_id.is_empty() {
        builder = builder
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key);
    }

    let s3 = builder
        .build()
        .map_err(|e| StorageError::open_failed(format!("Failed to create S3 client: {}", e)))?;

    info!(
        endpoint = %config.endpoint,
        bucket = %config.bucket,
        requester_pays = config.requester_pays,
        "Opened object store"
    );

    let async_store = Arc::new(AsyncObjectStore::new(s3));
    Ok(AsyncToSyncStorageAdapter::new(async_store, TokioBlockOn))
}

/// Convert a Zarr node path ("/dataset/var_target.zarr") into a store prefix
/// ("dataset/var_target.zarr/").
pub fn node_prefix(path: &str) -> Result<StorePrefix> {
    let trimmed = path.trim_matches('/');
    let prefix = if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    };
    StorePrefix::new(prefix.clone()).map_err(|e| StorageError::invalid_key(prefix, e))
}

fn node_key(path: &str, name: &str) -> Result<StoreKey> {
    let trimmed = path.trim_matches('/');
    let key = if trimmed.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", trimmed, name)
    };
    StoreKey::new(key.clone()).map_err(|e| StorageError::invalid_key(key, e))
}

/// True when a Zarr V3 node (array or group) exists at `path`.
pub fn array_exists(store: &ZarrStore, path: &str) -> Result<bool> {
    let key = node_key(path, "zarr.json")?;
    Ok(store.get(&key)?.is_some())
}

/// Erase every key below `path`, including its metadata.
///
/// This is the explicit reset used before retrying a failed rewrite; nothing
/// calls it implicitly on a target store.
pub fn clear_prefix(store: &ZarrStore, path: &str) -> Result<()> {
    let prefix = node_prefix(path)?;
    if prefix.as_str().is_empty() {
        return Err(StorageError::Config(
            "refusing to clear the store root".to_string(),
        ));
    }
    store.erase_prefix(&prefix)?;
    info!(path = %path, "Cleared store prefix");
    Ok(())
}

/// Write a standalone object (not part of a Zarr node) at `key`.
pub fn put_object(store: &ZarrStore, key: &str, value: Bytes) -> Result<()> {
    let key = StoreKey::new(key.trim_start_matches('/'))
        .map_err(|e| StorageError::invalid_key(key, e))?;
    store.set(&key, value)?;
    debug!(key = %key.as_str(), "Wrote object");
    Ok(())
}

/// Read a standalone object, `None` when absent.
pub fn get_object(store: &ZarrStore, key: &str) -> Result<Option<Bytes>> {
    let key = StoreKey::new(key.trim_start_matches('/'))
        .map_err(|e| StorageError::invalid_key(key, e))?;
    Ok(store.get(&key)?)
}

/// Result of a write-capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCapability {
    Writable,
    ReadOnly,
}

impl WriteCapability {
    pub fn is_writable(self) -> bool {
        self == Self::Writable
    }
}

/// Check whether the store accepts writes below `path`.
///
/// Writes and then erases a small marker key. Any failure is reported as
/// [`WriteCapability::ReadOnly`] rather than as an error.
pub fn check_write(store: &ZarrStore, path: &str) -> Result<WriteCapability> {
    let key = node_key(path, CHECK_KEY)?;

    if let Err(e) = store.set(&key, Bytes::from_static(b"check")) {
        warn!(path = %path, error = %e, "Store rejected test write");
        return Ok(WriteCapability::ReadOnly);
    }

    if let Err(e) = store.erase(&key) {
        warn!(path = %path, error = %e, "Store rejected test erase");
        return Ok(WriteCapability::ReadOnly);
    }

    Ok(WriteCapability::Writable)
}

/// Like [`check_write`], but turns a read-only store into an error.
pub fn require_writable(store: &ZarrStore, path: &str) -> Result<()> {
    match check_write(store, path)? {
        WriteCapability::Writable => Ok(()),
        WriteCapability::ReadOnly => Err(StorageError::ReadOnly(path.to_string())),
    }
}
