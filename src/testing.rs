use std::path::Path;

use anyhow::Result;
use axum::Router;
use blob_store::BlobStorageConfig;
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};
use upload_coordinator::UploadsConfig;

use crate::{config::ServerConfig, service::Service};

pub struct TestService {
    pub service: Service,
    pub temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    /// Builds a service rooted in a fresh temp dir. `customize` can adjust
    /// the config after the directories have been pointed at it.
    pub async fn with_config(customize: impl FnOnce(&mut ServerConfig)) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        let mut cfg = ServerConfig {
            uploads: UploadsConfig {
                temp_chunks_dir: path_string(&root.join("temp_chunks")),
                uploads_dir: path_string(&root.join("uploads")),
                ..Default::default()
            },
            blob_storage: BlobStorageConfig::new(&path_string(&root.join("blob_store"))),
            ..Default::default()
        };
        customize(&mut cfg);
        std::fs::create_dir_all(root.join("blob_store"))?;

        let service = Service::new(cfg).await?;
        Ok(Self { service, temp_dir })
    }

    pub fn router(&self) -> Router {
        self.service.routes()
    }

    pub fn path(&self, relative: &str) -> std::path::PathBuf {
        self.temp_dir.path().join(relative)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
