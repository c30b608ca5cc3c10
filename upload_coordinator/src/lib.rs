//! Chunked-upload session coordination.
//!
//! Chunks of one recording arrive as independent submissions, possibly out
//! of order and concurrently. The [`UploadCoordinator`] stores each chunk in
//! a [`ChunkStore`], tracks the received indices per session in the
//! [`SessionRegistry`], and once a session holds exactly `0..total` hands it
//! to the [`Reassembler`], which concatenates the chunks into the final
//! artifact.

use std::time::{SystemTime, UNIX_EPOCH};

mod chunk_store;
mod config;
mod coordinator;
mod error;
mod reassembly;
mod registry;
#[cfg(test)]
mod testing;
mod validation;

pub use chunk_store::{
    BlobChunkStore,
    ChunkKey,
    ChunkStore,
    ChunkStream,
    LocalChunkStore,
    StagedChunk,
};
pub use config::{ArtifactLayout, ChunkStorageMode, UploadsConfig};
pub use coordinator::{ChunkReceipt, ChunkSubmission, SubmitOutcome, UploadCoordinator};
pub use error::{ErrorKind, UploadError, UploadResult};
pub use reassembly::{ArtifactRef, Reassembler};
pub use registry::{
    RecordOutcome,
    Session,
    SessionHandle,
    SessionRegistry,
    SessionSnapshot,
    SessionState,
};
pub use validation::validate_session_id;

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
