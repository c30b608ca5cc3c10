use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStorageMode {
    /// One file per chunk under `temp_chunks_dir`.
    #[default]
    Local,
    /// One object per chunk under `remote_prefix` in the blob store.
    Remote,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactLayout {
    /// `uploads_dir/{uuid}_final_video.ext`
    #[default]
    Flat,
    /// `uploads_dir/{session}/{uuid}_final_video.ext`
    PerSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    #[serde(default = "default_temp_chunks_dir")]
    pub temp_chunks_dir: String,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
    /// Extension appended to chunk names, without the dot.
    #[serde(default = "default_extension")]
    pub chunk_extension: Option<String>,
    /// Extension of the final artifact, without the dot.
    #[serde(default = "default_extension")]
    pub artifact_extension: Option<String>,
    #[serde(default)]
    pub artifact_layout: ArtifactLayout,
    #[serde(default)]
    pub chunk_storage: ChunkStorageMode,
    /// Push finished artifacts to the blob store and delete the local copy.
    #[serde(default)]
    pub relocate_artifacts: bool,
    /// Key prefix for every object this server writes to the blob store.
    #[serde(default = "default_remote_prefix")]
    pub remote_prefix: String,
    /// Base URL local artifacts are served from (`{base}/files/uploads/...`).
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Upper bound for `totalChunks`, and for indices while the total is
    /// still unknown.
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,
    /// Idle time after which the sweep may drop an unfinished session.
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        UploadsConfig {
            temp_chunks_dir: default_temp_chunks_dir(),
            uploads_dir: default_uploads_dir(),
            chunk_extension: default_extension(),
            artifact_extension: default_extension(),
            artifact_layout: ArtifactLayout::default(),
            chunk_storage: ChunkStorageMode::default(),
            relocate_artifacts: false,
            remote_prefix: default_remote_prefix(),
            public_base_url: default_public_base_url(),
            max_total_chunks: default_max_total_chunks(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
        }
    }
}

impl UploadsConfig {
    /// Whether this configuration talks to the blob store at all.
    pub fn needs_blob_store(&self) -> bool {
        self.chunk_storage == ChunkStorageMode::Remote || self.relocate_artifacts
    }
}

fn default_temp_chunks_dir() -> String {
    "temp_chunks".to_string()
}

fn default_uploads_dir() -> String {
    "uploads".to_string()
}

fn default_extension() -> Option<String> {
    Some("webm".to_string())
}

fn default_remote_prefix() -> String {
    "testing".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_total_chunks() -> u32 {
    100_000
}

fn default_session_idle_timeout_secs() -> u64 {
    24 * 60 * 60
}
