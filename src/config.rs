use std::{fmt::Debug, net::SocketAddr, time::Duration};

use anyhow::Result;
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use upload_coordinator::UploadsConfig;
use uuid::Uuid;

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Largest request body accepted by the upload routes.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: default_env(),
            listen_addr: default_listen_addr(),
            max_chunk_bytes: default_max_chunk_bytes(),
            uploads: Default::default(),
            blob_storage: Default::default(),
            telemetry: Default::default(),
        }
    }
}

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_chunk_bytes() -> usize {
    100 * 1024 * 1024
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.max_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("max_chunk_bytes must be positive"));
        }
        if self.uploads.max_total_chunks == 0 {
            return Err(anyhow::anyhow!("uploads.max_total_chunks must be positive"));
        }
        if self.uploads.needs_blob_store() {
            if self.uploads.remote_prefix.trim_matches('/').is_empty() {
                return Err(anyhow::anyhow!(
                    "uploads.remote_prefix is required when the blob store is used"
                ));
            }
            if self.blob_storage.path.is_empty() {
                return Err(anyhow::anyhow!(
                    "blob_storage.path is required for remote chunks or relocated artifacts"
                ));
            }
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.telemetry.structured_logging.unwrap_or(self.env != LOCAL_ENV)
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Enable OpenTelemetry tracing
    #[serde(default)]
    pub enable_tracing: bool,
    // Enable OTLP metrics export
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector endpoint, the exporter default when unset
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    // JSON logs; defaults to on outside the local env
    #[serde(default)]
    pub structured_logging: Option<bool>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval_secs: default_metrics_interval_secs(),
            structured_logging: None,
            instance_id: None,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}
