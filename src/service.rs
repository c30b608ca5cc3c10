use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use axum_server::Handle;
use blob_store::BlobStorage;
use tokio::{self, signal};
use tracing::{error, info};
use upload_coordinator::UploadCoordinator;

use crate::{
    config::ServerConfig,
    routes::{create_routes, RouteState, RouterConfig},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub instance_id: String,
    pub coordinator: Arc<UploadCoordinator>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let instance_id = config.instance_id();

        // Only touch the blob store when something is configured to live there.
        let blob_storage = if config.uploads.needs_blob_store() {
            Some(Arc::new(
                BlobStorage::new(config.blob_storage.clone())
                    .context("error initializing BlobStorage")?,
            ))
        } else {
            None
        };

        let coordinator = Arc::new(
            UploadCoordinator::new(config.uploads.clone(), blob_storage)
                .await
                .context("error initializing upload coordinator")?,
        );

        Ok(Self {
            config,
            instance_id,
            coordinator,
        })
    }

    pub fn routes(&self) -> Router {
        let route_state = RouteState {
            coordinator: self.coordinator.clone(),
            session_idle_timeout_secs: self.config.uploads.session_idle_timeout_secs,
        };
        let router_config = RouterConfig {
            env: self.config.env.clone(),
            instance_id: self.instance_id.clone(),
            uploads_dir: self.config.uploads.uploads_dir.clone(),
            max_chunk_bytes: self.config.max_chunk_bytes,
        };
        create_routes(route_state, router_config)
    }

    pub async fn start(&self) -> Result<()> {
        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!(
            uploads_dir = self.config.uploads.uploads_dir.as_str(),
            temp_chunks_dir = self.config.uploads.temp_chunks_dir.as_str(),
            "server api listening on {}",
            self.config.listen_addr
        );
        axum_server::bind(addr)
            .handle(handle)
            .serve(self.routes().into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    info!("signal received, shutting down server gracefully");
}
