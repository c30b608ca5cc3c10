use std::time::Duration;

use axum::{
    extract::{
        multipart::{Field, MultipartError},
        rejection::JsonRejection,
        Multipart,
        Path,
        State,
    },
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use futures::{stream, StreamExt};
use tracing::debug;
use upload_coordinator::{ChunkSubmission, ChunkStream};

use super::RouteState;
use crate::http_objects::{
    ChunkReceived,
    ChunkUploadForm,
    FinalizeRequest,
    SessionStatus,
    SweepRequest,
    SweepResponse,
    UploadAPIError,
    UploadComplete,
    UploadResponse,
};

/// Fields of a chunk upload. The file part may arrive before the metadata
/// parts, so the payload is buffered until the whole form has been read.
#[derive(Default)]
struct ChunkForm {
    chunk_index: Option<u32>,
    total_chunks: Option<u32>,
    session: Option<String>,
    video_chunk: Option<Bytes>,
}

impl ChunkForm {
    async fn read(mut multipart: Multipart) -> Result<Self, UploadAPIError> {
        let mut form = ChunkForm::default();
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match name.as_str() {
                "chunkIndex" => form.chunk_index = Some(parse_count(field, "chunkIndex").await?),
                "totalChunks" => {
                    form.total_chunks = Some(parse_count(field, "totalChunks").await?)
                }
                "session" => form.session = Some(field.text().await.map_err(multipart_error)?),
                "videoChunk" => {
                    form.video_chunk = Some(field.bytes().await.map_err(multipart_error)?)
                }
                _ => debug!(field = name.as_str(), "ignoring unknown form field"),
            }
        }
        Ok(form)
    }

    fn chunk_index(&self) -> Result<u32, UploadAPIError> {
        self.chunk_index
            .ok_or_else(|| UploadAPIError::bad_request("chunkIndex is required"))
    }

    fn session(&mut self) -> Result<String, UploadAPIError> {
        self.session
            .take()
            .filter(|session| !session.is_empty())
            .ok_or_else(|| UploadAPIError::bad_request("session is required"))
    }

    fn payload(&mut self) -> Result<ChunkStream, UploadAPIError> {
        let bytes = self
            .video_chunk
            .take()
            .ok_or_else(|| UploadAPIError::bad_request("videoChunk is required"))?;
        Ok(stream::once(async move { Ok(bytes) }).boxed())
    }
}

async fn parse_count(field: Field<'_>, name: &str) -> Result<u32, UploadAPIError> {
    let text = field.text().await.map_err(multipart_error)?;
    text.trim()
        .parse::<u32>()
        .map_err(|_| UploadAPIError::bad_request(&format!("Invalid {name}")))
}

fn multipart_error(e: MultipartError) -> UploadAPIError {
    UploadAPIError::new(e.status(), &e.body_text())
}

fn json_error(e: JsonRejection) -> UploadAPIError {
    UploadAPIError::bad_request(&e.body_text())
}

/// Upload one chunk; the chunk that completes the session returns the artifact
#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = ChunkUploadForm, content_type = "multipart/form-data"),
    tag = "uploads",
    responses(
        (status = 200, description = "Chunk stored, or upload complete", body = UploadResponse),
        (status = BAD_REQUEST, description = "Malformed form or out of range chunk", body = UploadAPIError),
        (status = CONFLICT, description = "Session is being finalized or is closed", body = UploadAPIError),
        (status = INTERNAL_SERVER_ERROR, description = "Storage failure", body = UploadAPIError),
        (status = BAD_GATEWAY, description = "Artifact relocation failed", body = UploadAPIError),
    ),
)]
pub async fn upload_chunk(
    State(state): State<RouteState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, UploadAPIError> {
    let mut form = ChunkForm::read(multipart).await?;
    let index = form.chunk_index()?;
    let total = form
        .total_chunks
        .ok_or_else(|| UploadAPIError::bad_request("totalChunks is required"))?;
    let submission = ChunkSubmission {
        session: form.session()?,
        index,
        total: Some(total),
        auto_finalize: true,
    };
    let outcome = state
        .coordinator
        .submit_chunk(submission, form.payload()?)
        .await?;
    Ok(Json(outcome.into()))
}

/// Upload one chunk of a screen recording; never finalizes
#[utoipa::path(
    post,
    path = "/upload-screen-recording",
    request_body(content = ChunkUploadForm, content_type = "multipart/form-data"),
    tag = "uploads",
    responses(
        (status = 200, description = "Chunk stored", body = ChunkReceived),
        (status = BAD_REQUEST, description = "Malformed form or out of range chunk", body = UploadAPIError),
        (status = INTERNAL_SERVER_ERROR, description = "Storage failure", body = UploadAPIError),
    ),
)]
pub async fn upload_screen_recording(
    State(state): State<RouteState>,
    multipart: Multipart,
) -> Result<Json<ChunkReceived>, UploadAPIError> {
    let mut form = ChunkForm::read(multipart).await?;
    let submission = ChunkSubmission {
        index: form.chunk_index()?,
        total: form.total_chunks,
        session: form.session()?,
        auto_finalize: false,
    };
    let outcome = state
        .coordinator
        .submit_chunk(submission, form.payload()?)
        .await?;
    match UploadResponse::from(outcome) {
        UploadResponse::Received(received) => Ok(Json(received)),
        UploadResponse::Complete(_) => Err(UploadAPIError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "screen recording chunk unexpectedly finalized the session",
        )),
    }
}

/// Reassemble every chunk of a session into the final video
#[utoipa::path(
    post,
    path = "/finalize",
    request_body = FinalizeRequest,
    tag = "uploads",
    responses(
        (status = 200, description = "Upload complete", body = UploadComplete),
        (status = BAD_REQUEST, description = "Invalid request or chunk count mismatch", body = UploadAPIError),
        (status = NOT_FOUND, description = "Unknown session", body = UploadAPIError),
        (status = CONFLICT, description = "Chunks missing or finalize already running", body = UploadAPIError),
        (status = INTERNAL_SERVER_ERROR, description = "Storage failure", body = UploadAPIError),
        (status = BAD_GATEWAY, description = "Artifact relocation failed", body = UploadAPIError),
    ),
)]
pub async fn finalize_upload(
    State(state): State<RouteState>,
    request: Result<Json<FinalizeRequest>, JsonRejection>,
) -> Result<Json<UploadComplete>, UploadAPIError> {
    let Json(request) = request.map_err(json_error)?;
    let artifact = state
        .coordinator
        .finalize(&request.session, request.total_chunks)
        .await?;
    Ok(Json(artifact.into()))
}

/// Chunks received so far for a session
#[utoipa::path(
    get,
    path = "/sessions/{session}",
    params(("session" = String, Path, description = "Upload session id")),
    tag = "uploads",
    responses(
        (status = 200, description = "Session status", body = SessionStatus),
        (status = NOT_FOUND, description = "Unknown or finished session", body = UploadAPIError),
    ),
)]
pub async fn session_status(
    State(state): State<RouteState>,
    Path(session): Path<String>,
) -> Result<Json<SessionStatus>, UploadAPIError> {
    let snapshot = state.coordinator.status(&session).await?;
    Ok(Json(snapshot.into()))
}

/// Abandon a session and delete its chunks
#[utoipa::path(
    delete,
    path = "/sessions/{session}",
    params(("session" = String, Path, description = "Upload session id")),
    tag = "uploads",
    responses(
        (status = 204, description = "Session removed"),
        (status = NOT_FOUND, description = "Unknown session", body = UploadAPIError),
        (status = CONFLICT, description = "Session is being finalized", body = UploadAPIError),
    ),
)]
pub async fn reset_session(
    State(state): State<RouteState>,
    Path(session): Path<String>,
) -> Result<StatusCode, UploadAPIError> {
    state.coordinator.reset(&session).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Drop sessions that stopped receiving chunks
#[utoipa::path(
    post,
    path = "/admin/sweep",
    request_body = SweepRequest,
    tag = "uploads",
    responses(
        (status = 200, description = "Sessions removed", body = SweepResponse),
    ),
)]
pub async fn sweep_idle_sessions(
    State(state): State<RouteState>,
    request: Result<Json<SweepRequest>, JsonRejection>,
) -> Result<Json<SweepResponse>, UploadAPIError> {
    let Json(request) = request.map_err(json_error)?;
    let max_idle = Duration::from_secs(
        request
            .max_idle_secs
            .unwrap_or(state.session_idle_timeout_secs),
    );
    let swept = state.coordinator.sweep_idle(max_idle).await;
    Ok(Json(SweepResponse { swept }))
}
