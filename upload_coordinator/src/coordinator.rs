use std::{sync::Arc, time::Duration};

use blob_store::BlobStorage;
use metrics::{upload_stats, Timer};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    get_epoch_time_in_ms,
    reassembly::{ArtifactRef, Reassembler},
    registry::{RecordOutcome, SessionHandle, SessionRegistry, SessionSnapshot, SessionState},
    validate_session_id,
    BlobChunkStore,
    ChunkKey,
    ChunkStorageMode,
    ChunkStore,
    ChunkStream,
    LocalChunkStore,
    Session,
    UploadError,
    UploadResult,
    UploadsConfig,
};

/// One chunk as submitted by a client.
#[derive(Debug, Clone)]
pub struct ChunkSubmission {
    pub session: String,
    pub index: u32,
    /// Declared chunk count. Optional until the client knows it.
    pub total: Option<u32>,
    /// Reassemble as soon as this submission completes the session.
    pub auto_finalize: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReceipt {
    pub session: String,
    pub index: u32,
    pub received_count: u32,
    pub total: Option<u32>,
    pub duplicate: bool,
}

impl ChunkReceipt {
    fn new(session: &str, index: u32, outcome: &RecordOutcome) -> Self {
        Self {
            session: session.to_string(),
            index,
            received_count: outcome.received_count,
            total: outcome.total,
            duplicate: outcome.duplicate,
        }
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Received(ChunkReceipt),
    Finalized(ArtifactRef),
}

pub struct UploadCoordinator {
    registry: SessionRegistry,
    chunk_store: Arc<dyn ChunkStore>,
    reassembler: Reassembler,
    config: UploadsConfig,
    metrics: upload_stats::Metrics,
}

impl UploadCoordinator {
    /// Builds the chunk store selected by `config.chunk_storage`. The blob
    /// store is only required for remote chunks or artifact relocation.
    pub async fn new(
        config: UploadsConfig,
        blob_storage: Option<Arc<BlobStorage>>,
    ) -> UploadResult<Self> {
        let chunk_store: Arc<dyn ChunkStore> = match config.chunk_storage {
            ChunkStorageMode::Local => Arc::new(
                LocalChunkStore::new(&config.temp_chunks_dir, config.chunk_extension.clone())
                    .await?,
            ),
            ChunkStorageMode::Remote => {
                let storage = blob_storage.clone().ok_or_else(|| {
                    UploadError::invalid_input("remote chunk storage requires a blob store")
                })?;
                Arc::new(BlobChunkStore::new(
                    storage,
                    &config.remote_prefix,
                    config.chunk_extension.clone(),
                ))
            }
        };
        Self::with_chunk_store(config, chunk_store, blob_storage)
    }

    pub fn with_chunk_store(
        config: UploadsConfig,
        chunk_store: Arc<dyn ChunkStore>,
        blob_storage: Option<Arc<BlobStorage>>,
    ) -> UploadResult<Self> {
        let reassembler = Reassembler::new(chunk_store.clone(), blob_storage, config.clone())?;
        Ok(Self {
            registry: SessionRegistry::new(),
            chunk_store,
            reassembler,
            config,
            metrics: upload_stats::Metrics::new(),
        })
    }

    /// Stores one chunk and records it against its session.
    ///
    /// Returns [`SubmitOutcome::Finalized`] only for the submission that
    /// completed the session, and only when `auto_finalize` is set; every
    /// other accepted submission gets a receipt.
    #[tracing::instrument(skip_all, fields(session = %submission.session, index = submission.index))]
    pub async fn submit_chunk(
        &self,
        submission: ChunkSubmission,
        data: ChunkStream,
    ) -> UploadResult<SubmitOutcome> {
        let ChunkSubmission {
            session: id,
            index,
            total,
            auto_finalize,
        } = submission;
        validate_session_id(&id)?;
        let max_total = self.config.max_total_chunks;

        // Unknown ids are validated against a blank session so a rejected
        // first chunk leaves nothing in the registry.
        let admitted = match self.registry.get(&id) {
            Some(handle) => {
                let session = handle.lock().await;
                session.admit_chunk(index, total, max_total)?
            }
            None => Session::new(&id).admit_chunk(index, total, max_total)?,
        };
        if let Some(outcome) = admitted {
            return Ok(self.duplicate_receipt(&id, index, &outcome));
        }

        let staged = self
            .chunk_store
            .stage(&ChunkKey::new(&id, index), data)
            .await?;
        let written = staged.size_bytes;

        // A closed session keeps its entry until its chunks are reclaimed, so
        // this never returns a fresh session while old keys are being deleted.
        let handle = self.registry.entry(&id);
        let outcome = {
            let mut session = handle.lock().await;
            // The session may have moved on while the chunk was staged. The
            // key is only written under the lock, once admission holds.
            let admitted = match session.admit_chunk(index, total, max_total) {
                Ok(admitted) => admitted,
                Err(e) => {
                    drop(session);
                    self.chunk_store.abort(staged).await;
                    return Err(e);
                }
            };
            if let Some(outcome) = admitted {
                drop(session);
                self.chunk_store.abort(staged).await;
                return Ok(self.duplicate_receipt(&id, index, &outcome));
            }
            if let Err(e) = self.chunk_store.commit(&staged).await {
                drop(session);
                self.chunk_store.abort(staged).await;
                return Err(e);
            }

            let outcome = session.record_chunk(index, total, max_total)?;
            if outcome.is_complete && auto_finalize {
                session.begin_merge()?;
            }
            outcome
        };
        self.metrics.chunks_received.add(1, &[]);
        self.metrics.chunk_bytes.add(written, &[]);
        debug!(
            received = outcome.received_count,
            total = ?outcome.total,
            bytes = written,
            "chunk recorded"
        );

        match outcome.total {
            Some(total) if outcome.is_complete && auto_finalize => {
                let artifact = self.run_merge(&id, &handle, total).await?;
                Ok(SubmitOutcome::Finalized(artifact))
            }
            _ => Ok(SubmitOutcome::Received(ChunkReceipt::new(
                &id, index, &outcome,
            ))),
        }
    }

    fn duplicate_receipt(&self, id: &str, index: u32, outcome: &RecordOutcome) -> SubmitOutcome {
        self.metrics.duplicate_chunks.add(1, &[]);
        debug!("chunk already received");
        SubmitOutcome::Received(ChunkReceipt::new(id, index, outcome))
    }

    /// Reassembles a session on request. Fixes the total if it was not known
    /// yet and fails with [`UploadError::Incomplete`] unless every index in
    /// `0..total` has been received.
    #[tracing::instrument(skip(self))]
    pub async fn finalize(&self, session: &str, total: u32) -> UploadResult<ArtifactRef> {
        validate_session_id(session)?;
        let handle = self
            .registry
            .get(session)
            .ok_or_else(|| UploadError::SessionNotFound {
                session: session.to_string(),
            })?;
        {
            let mut guard = handle.lock().await;
            guard.establish_total(total, self.config.max_total_chunks)?;
            guard.begin_merge()?;
        }
        self.run_merge(session, &handle, total).await
    }

    // Caller must have moved the session to `Merging`.
    async fn run_merge(
        &self,
        id: &str,
        handle: &SessionHandle,
        total: u32,
    ) -> UploadResult<ArtifactRef> {
        let result = {
            let _timer = Timer::start(&self.metrics.finalize_duration);
            self.reassembler.reassemble(id, total).await
        };

        let mut session = handle.lock().await;
        match result {
            Ok(artifact) => {
                session.mark_done();
                drop(session);
                self.metrics
                    .finalizations
                    .add(1, &[KeyValue::new("outcome", "done")]);
                self.metrics.artifact_bytes.add(artifact.size_bytes, &[]);
                info!(
                    session = id,
                    total,
                    url = artifact.url.as_str(),
                    "session finalized"
                );

                // The entry outlives the reclaim so a new session with this id
                // cannot be created while these keys are deleted.
                let indices: Vec<u32> = (0..total).collect();
                if let Err(e) = self.reassembler.reclaim(id, &indices).await {
                    warn!(session = id, "failed to reclaim chunks: {:?}", e);
                }
                self.registry.remove(id, handle);
                Ok(artifact)
            }
            Err(e) => {
                let missing_chunk = match &e {
                    UploadError::ChunkMissing { index, .. } => Some(*index),
                    _ => None,
                };
                session.mark_failed(e.to_string(), missing_chunk);
                drop(session);
                self.metrics
                    .finalizations
                    .add(1, &[KeyValue::new("outcome", "failed")]);
                error!(session = id, "finalize failed: {:?}", e);
                Err(e)
            }
        }
    }

    /// Drops a session and deletes its chunks. Refused while it is merging
    /// or already closed.
    #[tracing::instrument(skip(self))]
    pub async fn reset(&self, session: &str) -> UploadResult<()> {
        let handle = self
            .registry
            .get(session)
            .ok_or_else(|| UploadError::SessionNotFound {
                session: session.to_string(),
            })?;
        let closed = || UploadError::SessionClosed {
            session: session.to_string(),
        };
        let indices = {
            let mut guard = handle.lock().await;
            if guard.is_removed() || *guard.state() == SessionState::Done {
                return Err(closed());
            }
            if *guard.state() == SessionState::Merging {
                return Err(UploadError::FinalizeInProgress {
                    session: session.to_string(),
                });
            }
            guard.mark_removed();
            guard.received_indices()
        };
        info!(session, chunks = indices.len(), "session reset");
        let reclaimed = self.reassembler.reclaim(session, &indices).await;
        self.registry.remove(session, &handle);
        reclaimed
    }

    pub async fn status(&self, session: &str) -> UploadResult<SessionSnapshot> {
        self.registry.status(session).await
    }

    /// Removes sessions that have not received a chunk for `max_idle`,
    /// along with their chunks. Returns the ids that were dropped.
    pub async fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        let cutoff = get_epoch_time_in_ms().saturating_sub(max_idle.as_millis() as u64);
        let mut swept = Vec::new();
        for (id, handle) in self.registry.idle_sessions(cutoff).await {
            let indices = {
                let mut guard = handle.lock().await;
                // Re-checked: the session may have been touched since it was listed.
                if guard.is_removed() || !guard.is_idle_since(cutoff) {
                    continue;
                }
                guard.mark_removed();
                guard.received_indices()
            };
            if let Err(e) = self.reassembler.reclaim(&id, &indices).await {
                warn!(session = id.as_str(), "failed to reclaim chunks: {:?}", e);
            }
            self.registry.remove(&id, &handle);
            swept.push(id);
        }
        if !swept.is_empty() {
            self.metrics.sessions_swept.add(swept.len() as u64, &[]);
            info!(count = swept.len(), "swept idle sessions");
        }
        swept
    }
}
