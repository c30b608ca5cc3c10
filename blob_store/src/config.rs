//! Blob storage configuration.

use std::env;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// Storage location, e.g. `file:///var/lib/screencast/blobs`,
    /// `s3://bucket/prefix` or `gs://bucket/prefix`.
    #[serde(default = "default_blob_store_path")]
    pub path: String,

    /// AWS region (S3 only). Falls back to `AWS_REGION` / `AWS_DEFAULT_REGION`.
    #[serde(default)]
    pub region: Option<String>,

    /// Service account key file (GCS only).
    #[serde(default)]
    pub gcs_service_account_path: Option<String>,

    /// Public base URL for objects in this store, e.g.
    /// `https://storage.googleapis.com/my-bucket`. When unset, URLs are
    /// reported in the store's own scheme.
    #[serde(default)]
    pub public_url_base: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
            ..Default::default()
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        Self {
            path: default_blob_store_path(),
            region: None,
            gcs_service_account_path: None,
            public_url_base: None,
        }
    }
}

/// Default blob store path (local filesystem).
pub fn default_blob_store_path() -> String {
    format!(
        "file://{}",
        env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join("screencast_storage/blobs")
            .to_str()
            .unwrap_or("./screencast_storage/blobs")
    )
}
