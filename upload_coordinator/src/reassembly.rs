use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use blob_store::BlobStorage;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{ArtifactLayout, ChunkKey, ChunkStore, UploadError, UploadResult, UploadsConfig};

/// Where a finished recording ended up.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRef {
    pub id: Uuid,
    pub file_name: String,
    pub url: String,
    /// Set while the artifact lives on local disk.
    pub local_path: Option<PathBuf>,
    /// Set once the artifact has been relocated to the blob store.
    pub remote_key: Option<String>,
    pub size_bytes: u64,
    pub sha256: String,
}

pub struct Reassembler {
    chunk_store: Arc<dyn ChunkStore>,
    blob_storage: Option<Arc<BlobStorage>>,
    config: UploadsConfig,
}

impl Reassembler {
    pub fn new(
        chunk_store: Arc<dyn ChunkStore>,
        blob_storage: Option<Arc<BlobStorage>>,
        config: UploadsConfig,
    ) -> UploadResult<Self> {
        if config.relocate_artifacts && blob_storage.is_none() {
            return Err(UploadError::invalid_input(
                "relocate_artifacts requires a blob store",
            ));
        }
        Ok(Self {
            chunk_store,
            blob_storage,
            config,
        })
    }

    fn artifact_dir(&self, session: &str) -> PathBuf {
        let uploads_dir = Path::new(&self.config.uploads_dir);
        match self.config.artifact_layout {
            ArtifactLayout::Flat => uploads_dir.to_path_buf(),
            ArtifactLayout::PerSession => uploads_dir.join(session),
        }
    }

    fn artifact_name(&self, id: &Uuid) -> String {
        match &self.config.artifact_extension {
            Some(ext) => format!("{id}_final_video.{ext}"),
            None => format!("{id}_final_video"),
        }
    }

    fn local_url(&self, session: &str, file_name: &str) -> String {
        let base = self.config.public_base_url.trim_end_matches('/');
        match self.config.artifact_layout {
            ArtifactLayout::Flat => format!("{base}/files/uploads/{file_name}"),
            ArtifactLayout::PerSession => format!("{base}/files/uploads/{session}/{file_name}"),
        }
    }

    /// Concatenates chunks `0..total` of `session` into a new artifact.
    ///
    /// The artifact is written under a `.partial` name and renamed once every
    /// chunk has been copied and synced, so a failed merge leaves no artifact
    /// behind. Chunks are not touched; see [`Reassembler::reclaim`].
    pub async fn reassemble(&self, session: &str, total: u32) -> UploadResult<ArtifactRef> {
        let id = Uuid::new_v4();
        let file_name = self.artifact_name(&id);
        let dir = self.artifact_dir(session);
        fs::create_dir_all(&dir).await.map_err(|e| {
            UploadError::storage(format!("create artifact directory {}", dir.display()), e)
        })?;
        let final_path = dir.join(&file_name);
        let partial_path = dir.join(format!("{file_name}.partial"));

        let written = match self.concatenate(session, total, &partial_path).await {
            Ok(written) => fs::rename(&partial_path, &final_path)
                .await
                .map(|_| written)
                .map_err(|e| UploadError::storage(format!("commit artifact {file_name}"), e)),
            Err(e) => Err(e),
        };
        let (size_bytes, sha256) = match written {
            Ok(written) => written,
            Err(e) => {
                remove_quietly(&partial_path).await;
                return Err(e);
            }
        };
        info!(
            session,
            total,
            size_bytes,
            artifact = file_name.as_str(),
            "reassembled artifact"
        );

        if self.config.relocate_artifacts {
            return self
                .relocate(id, file_name, &final_path, size_bytes, sha256)
                .await;
        }
        Ok(ArtifactRef {
            id,
            url: self.local_url(session, &file_name),
            file_name,
            local_path: Some(final_path),
            remote_key: None,
            size_bytes,
            sha256,
        })
    }

    async fn concatenate(
        &self,
        session: &str,
        total: u32,
        path: &Path,
    ) -> UploadResult<(u64, String)> {
        let file = fs::File::create(path)
            .await
            .map_err(|e| UploadError::storage(format!("create {}", path.display()), e))?;
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;

        for index in 0..total {
            let key = ChunkKey::new(session, index);
            let mut chunk = self.chunk_store.get(&key).await?;
            while let Some(bytes) = chunk.next().await {
                let bytes =
                    bytes.map_err(|e| UploadError::storage(format!("read chunk {key}"), e))?;
                hasher.update(&bytes);
                size_bytes += bytes.len() as u64;
                writer
                    .write_all(&bytes)
                    .await
                    .map_err(|e| UploadError::storage(format!("append chunk {key}"), e))?;
            }
        }

        let write_err = |e: io::Error| UploadError::storage(format!("sync {}", path.display()), e);
        writer.flush().await.map_err(write_err)?;
        writer.get_ref().sync_all().await.map_err(write_err)?;
        Ok((size_bytes, format!("{:x}", hasher.finalize())))
    }

    async fn relocate(
        &self,
        id: Uuid,
        file_name: String,
        local_path: &Path,
        size_bytes: u64,
        sha256: String,
    ) -> UploadResult<ArtifactRef> {
        let Some(storage) = &self.blob_storage else {
            return Err(UploadError::invalid_input(
                "relocate_artifacts requires a blob store",
            ));
        };
        let remote_key = format!(
            "{}/{}",
            self.config.remote_prefix.trim_matches('/'),
            file_name
        );

        let file = fs::File::open(local_path)
            .await
            .map_err(|e| UploadError::storage(format!("open artifact {file_name}"), e))?;
        let data = ReaderStream::new(file).map_err(anyhow::Error::from).boxed();
        let put_result = match storage.put(&remote_key, data).await {
            Ok(put_result) => put_result,
            Err(e) => {
                // Retries produce a fresh artifact, this copy would be orphaned.
                remove_quietly(local_path).await;
                return Err(UploadError::remote(format!("upload {remote_key}"), e));
            }
        };

        if let Err(e) = fs::remove_file(local_path).await {
            if let Err(delete_err) = storage.delete(&remote_key).await {
                warn!(
                    remote_key = remote_key.as_str(),
                    "failed to roll back relocated artifact: {:?}", delete_err
                );
            }
            return Err(UploadError::remote(
                format!("remove local copy of {file_name}"),
                e,
            ));
        }
        info!(
            remote_key = remote_key.as_str(),
            url = put_result.url.as_str(),
            "relocated artifact"
        );

        Ok(ArtifactRef {
            id,
            file_name,
            url: put_result.url,
            local_path: None,
            remote_key: Some(remote_key),
            size_bytes,
            sha256,
        })
    }

    /// Deletes the given chunks of `session`. Every chunk is attempted; the
    /// first failure is returned.
    pub async fn reclaim(&self, session: &str, indices: &[u32]) -> UploadResult<()> {
        let mut first_error = None;
        for &index in indices {
            let key = ChunkKey::new(session, index);
            if let Err(e) = self.chunk_store.delete(&key).await {
                warn!(session, index, "failed to delete chunk: {:?}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {:?}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use blob_store::BlobStorageConfig;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        testing::{files_in, payload, test_config},
        LocalChunkStore,
    };

    async fn local_store(config: &UploadsConfig) -> Arc<dyn ChunkStore> {
        Arc::new(
            LocalChunkStore::new(&config.temp_chunks_dir, config.chunk_extension.clone())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_reassembles_in_index_order() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());
        let store = local_store(&config).await;
        for (index, data) in [(2, b"C"), (0, b"A"), (1, b"B")] {
            store
                .put(&ChunkKey::new("s1", index), payload(data))
                .await
                .unwrap();
        }

        let reassembler = Reassembler::new(store.clone(), None, config.clone()).unwrap();
        let artifact = reassembler.reassemble("s1", 3).await.unwrap();

        let local_path = artifact.local_path.clone().unwrap();
        assert_eq!(std::fs::read(&local_path).unwrap(), b"ABC");
        assert_eq!(artifact.size_bytes, 3);
        assert_eq!(
            artifact.sha256,
            "b5d4045c3f466fa91fe2cc6abe79232a1a57cdf104f7a26e716e0a1e2789df78"
        );
        assert_eq!(
            artifact.file_name,
            format!("{}_final_video.webm", artifact.id)
        );
        assert_eq!(
            artifact.url,
            format!("http://localhost:8080/files/uploads/{}", artifact.file_name)
        );
        assert_eq!(local_path.parent().unwrap(), Path::new(&config.uploads_dir));
        assert!(artifact.remote_key.is_none());

        // Chunks stay until they are reclaimed.
        assert_eq!(files_in(Path::new(&config.temp_chunks_dir)).len(), 3);
        reassembler.reclaim("s1", &[0, 1, 2]).await.unwrap();
        assert!(files_in(Path::new(&config.temp_chunks_dir)).is_empty());
    }

    #[tokio::test]
    async fn test_missing_chunk_leaves_no_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());
        let store = local_store(&config).await;
        store
            .put(&ChunkKey::new("s1", 0), payload(b"A"))
            .await
            .unwrap();
        store
            .put(&ChunkKey::new("s1", 2), payload(b"C"))
            .await
            .unwrap();

        let reassembler = Reassembler::new(store, None, config.clone()).unwrap();
        let err = reassembler.reassemble("s1", 3).await.unwrap_err();
        assert!(matches!(err, UploadError::ChunkMissing { index: 1, .. }));
        assert!(files_in(Path::new(&config.uploads_dir)).is_empty());
        assert_eq!(files_in(Path::new(&config.temp_chunks_dir)).len(), 2);
    }

    #[tokio::test]
    async fn test_per_session_layout() {
        let temp_dir = TempDir::new().unwrap();
        let config = UploadsConfig {
            artifact_layout: ArtifactLayout::PerSession,
            artifact_extension: None,
            ..test_config(temp_dir.path())
        };
        let store = local_store(&config).await;
        store
            .put(&ChunkKey::new("rec-7", 0), payload(b"only"))
            .await
            .unwrap();

        let reassembler = Reassembler::new(store, None, config.clone()).unwrap();
        let artifact = reassembler.reassemble("rec-7", 1).await.unwrap();

        let local_path = artifact.local_path.unwrap();
        assert_eq!(
            local_path.parent().unwrap(),
            Path::new(&config.uploads_dir).join("rec-7")
        );
        assert_eq!(artifact.file_name, format!("{}_final_video", artifact.id));
        assert!(artifact
            .url
            .ends_with(&format!("/files/uploads/rec-7/{}", artifact.file_name)));
    }

    #[tokio::test]
    async fn test_relocates_to_blob_store() {
        let temp_dir = TempDir::new().unwrap();
        let blob_dir = temp_dir.path().join("blobs");
        std::fs::create_dir_all(&blob_dir).unwrap();
        let storage = Arc::new(
            BlobStorage::new(BlobStorageConfig::new(blob_dir.to_str().unwrap())).unwrap(),
        );
        let config = UploadsConfig {
            relocate_artifacts: true,
            ..test_config(temp_dir.path())
        };
        let store = local_store(&config).await;
        store
            .put(&ChunkKey::new("s1", 0), payload(b"AB"))
            .await
            .unwrap();
        store
            .put(&ChunkKey::new("s1", 1), payload(b"CD"))
            .await
            .unwrap();

        let reassembler = Reassembler::new(store, Some(storage.clone()), config.clone()).unwrap();
        let artifact = reassembler.reassemble("s1", 2).await.unwrap();

        let remote_key = artifact.remote_key.clone().unwrap();
        assert_eq!(remote_key, format!("testing/{}", artifact.file_name));
        assert!(artifact.local_path.is_none());
        assert!(artifact.url.ends_with(&remote_key));
        assert_eq!(
            artifact.sha256,
            "e12e115acf4552b2568b55e93cbd39394c4ef81c82447fafc997882a02d23677"
        );
        assert_eq!(&storage.read_bytes(&remote_key).await.unwrap()[..], b"ABCD");
        assert!(files_in(Path::new(&config.uploads_dir)).is_empty());
    }

    #[tokio::test]
    async fn test_relocation_requires_blob_store() {
        let temp_dir = TempDir::new().unwrap();
        let config = UploadsConfig {
            relocate_artifacts: true,
            ..test_config(temp_dir.path())
        };
        let store = local_store(&config).await;
        assert!(Reassembler::new(store, None, config).is_err());
    }
}
