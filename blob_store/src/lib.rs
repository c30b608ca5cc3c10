//! Object storage used for chunk scratch space and relocated artifacts.
//!
//! [`BlobStorage`] wraps an [`ObjectStore`] built from a URL (`file://`,
//! `s3://`, `gs://`) and exposes streaming put/get plus delete. Keys are
//! relative to the configured path and may contain `/` separators.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, Stream, StreamExt};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    gcp::GoogleCloudStorageBuilder,
    parse_url,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    WriteMultipart,
};
use opentelemetry::KeyValue;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

mod config;
mod error;
mod metrics;

pub use config::{default_blob_store_path, BlobStorageConfig};
pub use error::{BlobError, BlobResult};
pub use metrics::{BlobMetrics, Timer};

#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    base_url: String,
    public_url_base: Option<String>,
    metrics: BlobMetrics,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> BlobResult<Self> {
        let (object_store, path) = Self::build_object_store(&config)?;
        info!("using blob store path: {}", config.path);
        let meter = opentelemetry::global::meter("blob_store");
        Ok(Self {
            object_store: Arc::new(object_store),
            path,
            base_url: config.path.trim_end_matches('/').to_string(),
            public_url_base: config
                .public_url_base
                .map(|base| base.trim_end_matches('/').to_string()),
            metrics: BlobMetrics::new(&meter),
        })
    }

    pub fn build_object_store(
        config: &BlobStorageConfig,
    ) -> BlobResult<(Box<dyn ObjectStore>, Path)> {
        let url = config.path.parse::<Url>()?;
        let (scheme, path) =
            ObjectStoreScheme::parse(&url).map_err(|e| BlobError::InvalidUrl {
                url: config.path.clone(),
                reason: e.to_string(),
            })?;
        let invalid = |e: object_store::Error| BlobError::InvalidUrl {
            url: config.path.clone(),
            reason: e.to_string(),
        };
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // AWS_* variables take priority over instance metadata credentials.
                let opts: Vec<(AmazonS3ConfigKey, String)> = std::env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        let (key, value) = (os_key.to_str()?, os_value.to_str()?);
                        if !key.starts_with("AWS_") {
                            return None;
                        }
                        let config_key = key.to_ascii_lowercase().parse().ok()?;
                        Some((config_key, value.to_string()))
                    })
                    .collect();

                let mut builder = AmazonS3Builder::new().with_url(config.path.as_str());
                for (key, value) in opts {
                    builder = builder.with_config(key, value);
                }
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                Ok((Box::new(builder.build().map_err(invalid)?), path))
            }
            ObjectStoreScheme::GoogleCloudStorage => {
                let mut builder =
                    GoogleCloudStorageBuilder::from_env().with_url(config.path.as_str());
                if let Some(key_path) = &config.gcs_service_account_path {
                    builder = builder.with_service_account_path(key_path);
                }
                Ok((Box::new(builder.build().map_err(invalid)?), path))
            }
            _ => parse_url(&url).map_err(invalid),
        }
    }

    fn object_path(&self, key: &str) -> Path {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.path.clone(), |path, part| path.child(part))
    }

    /// URL under which `key` is reachable, preferring the public base URL.
    pub fn url_for(&self, key: &str) -> String {
        let base = self.public_url_base.as_ref().unwrap_or(&self.base_url);
        format!("{}/{}", base, key.trim_start_matches('/'))
    }

    /// Streams `data` into `key`. The object only becomes visible once the
    /// stream has been fully drained; a failing stream aborts the upload.
    pub async fn put(
        &self,
        key: &str,
        data: impl Stream<Item = anyhow::Result<Bytes>> + Send + Unpin,
    ) -> BlobResult<PutResult> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &[KeyValue::new("op", "put")]);
        let result = self.put_inner(key, data).await;
        if result.is_err() {
            self.metrics.error("put");
        }
        result
    }

    async fn put_inner(
        &self,
        key: &str,
        mut data: impl Stream<Item = anyhow::Result<Bytes>> + Send + Unpin,
    ) -> BlobResult<PutResult> {
        let path = self.object_path(key);
        let multipart = self
            .object_store
            .put_multipart(&path)
            .await
            .map_err(|e| BlobError::object_store(key, e))?;
        let mut writer = WriteMultipart::new(multipart);
        let mut hasher = Sha256::new();
        let mut size_bytes = 0;

        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    if let Err(e) = writer.abort().await {
                        debug!(key, "failed to abort multipart upload: {:?}", e);
                    }
                    return Err(BlobError::InputStream {
                        key: key.to_string(),
                        source,
                    });
                }
            };
            writer
                .wait_for_capacity(1)
                .await
                .map_err(|e| BlobError::object_store(key, e))?;
            hasher.update(&chunk);
            size_bytes += chunk.len() as u64;
            writer.write(&chunk);
        }
        writer
            .finish()
            .await
            .map_err(|e| BlobError::object_store(key, e))?;

        Ok(PutResult {
            url: self.url_for(key),
            size_bytes,
            sha256_hash: format!("{:x}", hasher.finalize()),
        })
    }

    pub async fn get(&self, key: &str) -> BlobResult<BoxStream<'static, BlobResult<Bytes>>> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &[KeyValue::new("op", "get")]);
        let get_result = self
            .object_store
            .get(&self.object_path(key))
            .await
            .map_err(|e| {
                let err = BlobError::object_store(key, e);
                if !err.is_not_found() {
                    self.metrics.error("get");
                }
                err
            })?;
        let key = key.to_string();
        Ok(get_result
            .into_stream()
            .map(move |chunk| chunk.map_err(|e| BlobError::object_store(&key, e)))
            .boxed())
    }

    pub async fn exists(&self, key: &str) -> BlobResult<bool> {
        match self.object_store.head(&self.object_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(BlobError::object_store(key, e)),
        }
    }

    pub async fn delete(&self, key: &str) -> BlobResult<()> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &[KeyValue::new("op", "delete")]);
        self.object_store
            .delete(&self.object_path(key))
            .await
            .map_err(|e| {
                let err = BlobError::object_store(key, e);
                if !err.is_not_found() {
                    self.metrics.error("delete");
                }
                err
            })
    }

    /// Moves `from` to `to`, replacing any object already stored at `to`.
    pub async fn rename(&self, from: &str, to: &str) -> BlobResult<()> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &[KeyValue::new("op", "rename")]);
        self.object_store
            .rename(&self.object_path(from), &self.object_path(to))
            .await
            .map_err(|e| {
                let err = BlobError::object_store(from, e);
                if !err.is_not_found() {
                    self.metrics.error("rename");
                }
                err
            })
    }

    pub async fn read_bytes(&self, key: &str) -> BlobResult<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use tempfile::TempDir;

    use super::*;

    fn local_storage(dir: &TempDir) -> BlobStorage {
        BlobStorage::new(BlobStorageConfig::new(dir.path().to_str().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_nested_key() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir);

        let data = vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let result = storage
            .put("testing/greeting.txt", stream::iter(data))
            .await
            .unwrap();
        assert_eq!(result.size_bytes, 11);
        assert_eq!(
            result.sha256_hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(result.url.ends_with("/testing/greeting.txt"));
        assert!(temp_dir.path().join("testing/greeting.txt").exists());

        let bytes = storage.read_bytes("testing/greeting.txt").await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir);

        let err = storage.get("testing/missing.bin").await.err().unwrap();
        assert!(err.is_not_found());
        assert!(!storage.exists("testing/missing.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_object() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir);

        let data = vec![
            Ok(Bytes::from("partial")),
            Err(anyhow::anyhow!("client went away")),
        ];
        let err = storage
            .put("testing/broken.bin", stream::iter(data))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InputStream { .. }));
        assert!(!storage.exists("testing/broken.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir);

        storage
            .put("a/b.bin", stream::iter(vec![Ok(Bytes::from("x"))]))
            .await
            .unwrap();
        assert!(storage.exists("a/b.bin").await.unwrap());
        storage.delete("a/b.bin").await.unwrap();
        assert!(!storage.exists("a/b.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_replaces_target() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir);

        for (key, data) in [("staging/new.bin", "new"), ("final/b.bin", "old")] {
            storage
                .put(key, stream::iter(vec![Ok(Bytes::from(data))]))
                .await
                .unwrap();
        }
        storage.rename("staging/new.bin", "final/b.bin").await.unwrap();

        assert!(!storage.exists("staging/new.bin").await.unwrap());
        assert_eq!(&storage.read_bytes("final/b.bin").await.unwrap()[..], b"new");
        let err = storage.rename("staging/new.bin", "final/b.bin").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_url_for_prefers_public_base() {
        let temp_dir = TempDir::new().unwrap();
        let config = BlobStorageConfig {
            public_url_base: Some("https://storage.example.com/bucket/".to_string()),
            ..BlobStorageConfig::new(temp_dir.path().to_str().unwrap())
        };
        let storage = BlobStorage::new(config).unwrap();
        assert_eq!(
            storage.url_for("testing/video.webm"),
            "https://storage.example.com/bucket/testing/video.webm"
        );
    }
}
