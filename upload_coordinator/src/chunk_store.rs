use std::{
    fmt,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use blob_store::BlobStorage;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::{UploadError, UploadResult};

pub type ChunkStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// Identifies one chunk of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub session: String,
    pub index: u32,
}

impl ChunkKey {
    pub fn new(session: &str, index: u32) -> Self {
        Self {
            session: session.to_string(),
            index,
        }
    }

    /// `{session}_chunk_{index}[.ext]`
    pub fn file_name(&self, extension: Option<&str>) -> String {
        match extension {
            Some(ext) => format!("{}_chunk_{}.{}", self.session, self.index, ext),
            None => format!("{}_chunk_{}", self.session, self.index),
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.index)
    }
}

/// A chunk written under a private name, not yet visible under its key.
#[derive(Debug)]
pub struct StagedChunk {
    pub key: ChunkKey,
    /// Backend specific location of the staged bytes.
    location: String,
    pub size_bytes: u64,
}

/// Scratch storage for chunk payloads.
///
/// Writing is split in two so the bytes can be transferred without holding
/// the session lock while the key itself only changes under it: [`stage`]
/// drains the stream into a private location, [`commit`] moves it to the
/// chunk's key and [`abort`] throws it away.
///
/// [`stage`]: ChunkStore::stage
/// [`commit`]: ChunkStore::commit
/// [`abort`]: ChunkStore::abort
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Drains `data` into a location no other writer uses. A stream that
    /// fails leaves nothing behind.
    async fn stage(&self, key: &ChunkKey, data: ChunkStream) -> UploadResult<StagedChunk>;

    /// Makes a staged chunk visible under its key, replacing any previous
    /// payload.
    async fn commit(&self, staged: &StagedChunk) -> UploadResult<()>;

    /// Discards a staged chunk. Failures are logged, the key is untouched.
    async fn abort(&self, staged: StagedChunk);

    /// Opens a stored chunk. Fails with [`UploadError::ChunkMissing`] if the
    /// chunk was never stored or was already deleted.
    async fn get(&self, key: &ChunkKey) -> UploadResult<ChunkStream>;

    /// Deletes a chunk. Deleting an absent chunk succeeds.
    async fn delete(&self, key: &ChunkKey) -> UploadResult<()>;

    /// Stages and commits in one go. Returns the number of bytes written.
    async fn put(&self, key: &ChunkKey, data: ChunkStream) -> UploadResult<u64> {
        let staged = self.stage(key, data).await?;
        match self.commit(&staged).await {
            Ok(()) => Ok(staged.size_bytes),
            Err(e) => {
                self.abort(staged).await;
                Err(e)
            }
        }
    }
}

pub struct LocalChunkStore {
    dir: PathBuf,
    extension: Option<String>,
}

impl LocalChunkStore {
    pub async fn new(dir: impl Into<PathBuf>, extension: Option<String>) -> UploadResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            UploadError::storage(format!("create chunk directory {}", dir.display()), e)
        })?;
        Ok(Self { dir, extension })
    }

    pub fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.dir.join(key.file_name(self.extension.as_deref()))
    }

    async fn write_file(path: &Path, mut data: ChunkStream) -> anyhow::Result<u64> {
        let mut file = fs::File::create(path).await?;
        let mut written = 0;
        while let Some(bytes) = data.next().await {
            let bytes = bytes?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

async fn remove_staged_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("failed to remove {}: {:?}", path.display(), e),
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn stage(&self, key: &ChunkKey, data: ChunkStream) -> UploadResult<StagedChunk> {
        let tmp_path = self.dir.join(format!(
            ".{}.{}.tmp",
            key.file_name(self.extension.as_deref()),
            Uuid::new_v4()
        ));
        match Self::write_file(&tmp_path, data).await {
            Ok(size_bytes) => Ok(StagedChunk {
                key: key.clone(),
                location: tmp_path.to_string_lossy().into_owned(),
                size_bytes,
            }),
            Err(e) => {
                remove_staged_file(&tmp_path).await;
                Err(UploadError::storage(format!("store chunk {key}"), e))
            }
        }
    }

    async fn commit(&self, staged: &StagedChunk) -> UploadResult<()> {
        fs::rename(&staged.location, self.chunk_path(&staged.key))
            .await
            .map_err(|e| UploadError::storage(format!("commit chunk {}", staged.key), e))
    }

    async fn abort(&self, staged: StagedChunk) {
        remove_staged_file(Path::new(&staged.location)).await;
    }

    async fn get(&self, key: &ChunkKey) -> UploadResult<ChunkStream> {
        let file = fs::File::open(self.chunk_path(key))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => UploadError::ChunkMissing {
                    session: key.session.clone(),
                    index: key.index,
                },
                _ => UploadError::storage(format!("open chunk {key}"), e),
            })?;
        Ok(ReaderStream::new(file).map_err(anyhow::Error::from).boxed())
    }

    async fn delete(&self, key: &ChunkKey) -> UploadResult<()> {
        match fs::remove_file(self.chunk_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::storage(format!("delete chunk {key}"), e)),
        }
    }
}

/// Chunks stored as objects named `{prefix}/{session}_chunk_{index}[.ext]`.
/// Staged payloads live under `{prefix}/.staging/`.
pub struct BlobChunkStore {
    storage: Arc<BlobStorage>,
    prefix: String,
    extension: Option<String>,
}

impl BlobChunkStore {
    pub fn new(storage: Arc<BlobStorage>, prefix: &str, extension: Option<String>) -> Self {
        Self {
            storage,
            prefix: prefix.trim_matches('/').to_string(),
            extension,
        }
    }

    pub fn object_key(&self, key: &ChunkKey) -> String {
        format!(
            "{}/{}",
            self.prefix,
            key.file_name(self.extension.as_deref())
        )
    }

    fn staging_key(&self, key: &ChunkKey) -> String {
        format!(
            "{}/.staging/{}.{}",
            self.prefix,
            key.file_name(self.extension.as_deref()),
            Uuid::new_v4()
        )
    }
}

#[async_trait]
impl ChunkStore for BlobChunkStore {
    async fn stage(&self, key: &ChunkKey, data: ChunkStream) -> UploadResult<StagedChunk> {
        let location = self.staging_key(key);
        let put_result = self
            .storage
            .put(&location, data)
            .await
            .map_err(|e| UploadError::storage(format!("store chunk {key}"), e))?;
        Ok(StagedChunk {
            key: key.clone(),
            location,
            size_bytes: put_result.size_bytes,
        })
    }

    async fn commit(&self, staged: &StagedChunk) -> UploadResult<()> {
        self.storage
            .rename(&staged.location, &self.object_key(&staged.key))
            .await
            .map_err(|e| UploadError::storage(format!("commit chunk {}", staged.key), e))
    }

    async fn abort(&self, staged: StagedChunk) {
        match self.storage.delete(&staged.location).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!("failed to remove staged chunk {}: {:?}", staged.location, e),
        }
    }

    async fn get(&self, key: &ChunkKey) -> UploadResult<ChunkStream> {
        match self.storage.get(&self.object_key(key)).await {
            Ok(stream) => Ok(stream.map_err(anyhow::Error::from).boxed()),
            Err(e) if e.is_not_found() => Err(UploadError::ChunkMissing {
                session: key.session.clone(),
                index: key.index,
            }),
            Err(e) => Err(UploadError::storage(format!("open chunk {key}"), e)),
        }
    }

    async fn delete(&self, key: &ChunkKey) -> UploadResult<()> {
        match self.storage.delete(&self.object_key(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(UploadError::storage(format!("delete chunk {key}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use blob_store::BlobStorageConfig;
    use futures::stream;
    use tempfile::TempDir;

    use super::*;
    use crate::testing::{payload, read_all};

    #[tokio::test]
    async fn test_local_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalChunkStore::new(temp_dir.path().join("chunks"), Some("webm".into()))
            .await
            .unwrap();
        let key = ChunkKey::new("s1", 3);

        let written = store.put(&key, payload(b"hello")).await.unwrap();
        assert_eq!(written, 5);
        assert!(temp_dir.path().join("chunks/s1_chunk_3.webm").exists());

        let data = read_all(store.get(&key).await.unwrap()).await;
        assert_eq!(data, b"hello");

        store.delete(&key).await.unwrap();
        assert!(!store.chunk_path(&key).exists());
        // second delete is a no-op
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_put_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalChunkStore::new(temp_dir.path(), None).await.unwrap();
        let key = ChunkKey::new("s1", 0);

        store.put(&key, payload(b"first")).await.unwrap();
        store.put(&key, payload(b"second")).await.unwrap();

        let data = read_all(store.get(&key).await.unwrap()).await;
        assert_eq!(data, b"second");
        assert!(temp_dir.path().join("s1_chunk_0").exists());
    }

    #[tokio::test]
    async fn test_local_failed_stream_is_not_observable() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalChunkStore::new(temp_dir.path(), None).await.unwrap();
        let key = ChunkKey::new("s1", 0);

        let broken: ChunkStream = stream::iter(vec![
            Ok(Bytes::from_static(b"par")),
            Err(anyhow::anyhow!("connection reset")),
        ])
        .boxed();
        let err = store.put(&key, broken).await.unwrap_err();
        assert!(matches!(err, UploadError::Storage { .. }));

        let err = store.get(&key).await.err().unwrap();
        assert!(matches!(err, UploadError::ChunkMissing { index: 0, .. }));
        let leftovers = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_staged_chunk_is_invisible_until_committed() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalChunkStore::new(temp_dir.path(), Some("webm".into()))
            .await
            .unwrap();
        let key = ChunkKey::new("s1", 0);
        store.put(&key, payload(b"old")).await.unwrap();

        let kept = store.stage(&key, payload(b"new")).await.unwrap();
        let dropped = store.stage(&key, payload(b"other")).await.unwrap();
        assert_eq!(kept.size_bytes, 3);
        assert_eq!(read_all(store.get(&key).await.unwrap()).await, b"old");

        store.abort(dropped).await;
        assert_eq!(read_all(store.get(&key).await.unwrap()).await, b"old");
        store.commit(&kept).await.unwrap();
        assert_eq!(read_all(store.get(&key).await.unwrap()).await, b"new");

        let files: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec!["s1_chunk_0.webm".to_string()]);
    }

    #[tokio::test]
    async fn test_local_get_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalChunkStore::new(temp_dir.path(), None).await.unwrap();

        let err = store.get(&ChunkKey::new("nope", 7)).await.err().unwrap();
        match err {
            UploadError::ChunkMissing { session, index } => {
                assert_eq!(session, "nope");
                assert_eq!(index, 7);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blob_chunk_store() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(
            BlobStorage::new(BlobStorageConfig::new(temp_dir.path().to_str().unwrap())).unwrap(),
        );
        let store = BlobChunkStore::new(storage.clone(), "testing", Some("webm".into()));
        let key = ChunkKey::new("rec", 1);
        assert_eq!(store.object_key(&key), "testing/rec_chunk_1.webm");

        store.put(&key, payload(b"B")).await.unwrap();
        assert!(temp_dir.path().join("testing/rec_chunk_1.webm").exists());
        assert_eq!(read_all(store.get(&key).await.unwrap()).await, b"B");

        store.delete(&key).await.unwrap();
        let err = store.get(&key).await.err().unwrap();
        assert!(matches!(err, UploadError::ChunkMissing { .. }));
        store.delete(&key).await.unwrap();

        let staged = store.stage(&key, payload(b"C")).await.unwrap();
        assert!(matches!(
            store.get(&key).await.err().unwrap(),
            UploadError::ChunkMissing { .. }
        ));
        store.commit(&staged).await.unwrap();
        assert_eq!(read_all(store.get(&key).await.unwrap()).await, b"C");
        let aborted = store.stage(&key, payload(b"D")).await.unwrap();
        store.abort(aborted).await;
        assert!(std::fs::read_dir(temp_dir.path().join("testing/.staging"))
            .map(|entries| entries.count() == 0)
            .unwrap_or(true));
    }
}
