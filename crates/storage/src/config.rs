//! Store configuration (local filesystem or S3-compatible object storage).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Configuration for object storage connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// S3-compatible endpoint URL
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Access key ID
    #[serde(default)]
    pub access_key_id: String,
    /// Secret access key
    #[serde(default)]
    pub secret_access_key: String,
    /// Region (use "us-east-1" for MinIO)
    #[serde(default = "default_region")]
    pub region: String,
    /// Allow plain HTTP (local MinIO)
    #[serde(default)]
    pub allow_http: bool,
    /// Bill data transfer to the requester instead of the bucket owner.
    #[serde(default)]
    pub requester_pays: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://minio:9000".to_string(),
            bucket: "climate-data".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            region: default_region(),
            allow_http: true,
            requester_pays: false,
        }
    }
}
