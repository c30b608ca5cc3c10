use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use upload_coordinator::{
    ArtifactRef,
    ChunkReceipt,
    ErrorKind,
    SessionSnapshot,
    SessionState,
    SubmitOutcome,
    UploadError,
};
use utoipa::ToSchema;

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct UploadAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    #[serde(rename = "error")]
    message: String,
}

impl UploadAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for UploadAPIError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        } else {
            warn!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, Json(self)).into_response()
    }
}

impl From<UploadError> for UploadAPIError {
    fn from(e: UploadError) -> Self {
        let message = e.to_string();
        match (e.kind(), &e) {
            (_, UploadError::SessionNotFound { .. }) => Self::not_found(&message),
            (ErrorKind::ClientInput, _) => Self::bad_request(&message),
            (ErrorKind::Conflict, _) => Self::conflict(&message),
            (ErrorKind::Storage, _) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, &message),
            (ErrorKind::RemoteTransfer, _) => Self::new(StatusCode::BAD_GATEWAY, &message),
        }
    }
}

/// Multipart body of the chunk upload routes.
#[allow(dead_code)]
#[derive(ToSchema)]
#[schema(rename_all = "camelCase")]
pub struct ChunkUploadForm {
    /// 0-based position of the chunk.
    pub chunk_index: u32,
    /// Number of chunks in the recording. Optional for screen recordings.
    pub total_chunks: Option<u32>,
    pub session: String,
    #[schema(value_type = String, format = Binary)]
    pub video_chunk: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceived {
    pub message: String,
    pub session: String,
    pub chunk_index: u32,
    pub received_chunks: u32,
    pub total_chunks: Option<u32>,
    pub duplicate: bool,
}

impl From<ChunkReceipt> for ChunkReceived {
    fn from(receipt: ChunkReceipt) -> Self {
        let message = if receipt.duplicate {
            format!("Chunk {} already received", receipt.index)
        } else {
            format!("Chunk {} received", receipt.index)
        };
        Self {
            message,
            session: receipt.session,
            chunk_index: receipt.index,
            received_chunks: receipt.received_count,
            total_chunks: receipt.total,
            duplicate: receipt.duplicate,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadComplete {
    pub message: String,
    pub url: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_key: Option<String>,
}

impl From<ArtifactRef> for UploadComplete {
    fn from(artifact: ArtifactRef) -> Self {
        Self {
            message: "Upload complete".to_string(),
            url: artifact.url,
            file_name: artifact.file_name,
            size_bytes: artifact.size_bytes,
            sha256: artifact.sha256,
            remote_key: artifact.remote_key,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum UploadResponse {
    Complete(UploadComplete),
    Received(ChunkReceived),
}

impl From<SubmitOutcome> for UploadResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Received(receipt) => UploadResponse::Received(receipt.into()),
            SubmitOutcome::Finalized(artifact) => UploadResponse::Complete(artifact.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub total_chunks: u32,
    pub session: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub total_chunks: Option<u32>,
    pub received_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<SessionSnapshot> for SessionStatus {
    fn from(snapshot: SessionSnapshot) -> Self {
        let failure_reason = match &snapshot.state {
            SessionState::Failed { reason } => Some(reason.clone()),
            _ => None,
        };
        Self {
            session: snapshot.session,
            state: snapshot.state.as_str().to_string(),
            failure_reason,
            total_chunks: snapshot.total,
            received_chunks: snapshot.received,
            missing_chunks: snapshot.missing,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepRequest {
    /// Defaults to `uploads.session_idle_timeout_secs`.
    #[serde(default)]
    pub max_idle_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SweepResponse {
    pub swept: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                UploadError::invalid_input("bad"),
                StatusCode::BAD_REQUEST,
            ),
            (
                UploadError::SessionNotFound {
                    session: "s".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                UploadError::Incomplete {
                    session: "s".into(),
                    missing: vec![1],
                },
                StatusCode::CONFLICT,
            ),
            (
                UploadError::ChunkMissing {
                    session: "s".into(),
                    index: 1,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                UploadError::remote("upload", anyhow::anyhow!("timeout")),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(UploadAPIError::from(err).status_code, status);
        }
    }

    #[test]
    fn test_upload_response_shapes() {
        let received = serde_json::to_value(UploadResponse::Received(ChunkReceived {
            message: "Chunk 0 received".into(),
            session: "s1".into(),
            chunk_index: 0,
            received_chunks: 1,
            total_chunks: Some(3),
            duplicate: false,
        }))
        .unwrap();
        assert_eq!(received["chunkIndex"], 0);
        assert_eq!(received["receivedChunks"], 1);
        assert_eq!(received["totalChunks"], 3);

        let error = serde_json::to_value(UploadAPIError::bad_request("Invalid chunkIndex")).unwrap();
        assert_eq!(error, serde_json::json!({"error": "Invalid chunkIndex"}));
    }
}
