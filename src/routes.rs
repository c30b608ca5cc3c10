use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use upload_coordinator::UploadCoordinator;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    http_objects::{
        ChunkReceived,
        ChunkUploadForm,
        FinalizeRequest,
        SessionStatus,
        SweepRequest,
        SweepResponse,
        UploadAPIError,
        UploadComplete,
        UploadResponse,
    },
    middleware::UploadRequestSpan,
};

mod uploads;
use uploads::{
    finalize_upload,
    reset_session,
    session_status,
    sweep_idle_sessions,
    upload_chunk,
    upload_screen_recording,
};

#[derive(OpenApi)]
#[openapi(
        paths(
            uploads::upload_chunk,
            uploads::upload_screen_recording,
            uploads::finalize_upload,
            uploads::session_status,
            uploads::reset_session,
            uploads::sweep_idle_sessions,
        ),
        components(
            schemas(
                ChunkUploadForm,
                ChunkReceived,
                UploadComplete,
                UploadResponse,
                FinalizeRequest,
                SessionStatus,
                SweepRequest,
                SweepResponse,
                UploadAPIError,
            )
        ),
        tags(
            (name = "uploads", description = "Chunked screen recording uploads")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub coordinator: Arc<UploadCoordinator>,
    /// Fallback for sweeps that do not name an idle timeout.
    pub session_idle_timeout_secs: u64,
}

/// Settings that shape the router itself rather than request handling.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub env: String,
    pub instance_id: String,
    pub uploads_dir: String,
    pub max_chunk_bytes: usize,
}

pub fn create_routes(route_state: RouteState, router_config: RouterConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route("/upload", post(upload_chunk))
        .route("/upload-screen-recording", post(upload_screen_recording))
        .route("/finalize", post(finalize_upload))
        .route(
            "/sessions/{session}",
            get(session_status).delete(reset_session),
        )
        .route("/admin/sweep", post(sweep_idle_sessions))
        .nest_service(
            "/files/uploads",
            ServeDir::new(&router_config.uploads_dir),
        )
        .with_state(route_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(UploadRequestSpan::new(
                    &router_config.env,
                    &router_config.instance_id,
                ))
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(router_config.max_chunk_bytes))
}

async fn index() -> &'static str {
    "Screencast Upload Server"
}
