//! Application configuration, read from a TOML file.
//!
//! ```toml
//! [mqtt]
//! host = "localhost"
//! port = 1883
//! client_id = "zwave-bridge"
//! keep_alive_secs = 30
//! channel_capacity = 64
//!
//! [gateway]
//! topic_prefix = "zwave"
//! request_timeout_secs = 10
//! watch_buffer = 16
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mqtt::config::MqttConfig;

const CONFIG_DIR: &str = "zwave-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// How the bridge talks to the gateway on top of MQTT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Prefix the gateway puts in front of all its topics.
    pub topic_prefix: String,
    pub request_timeout_secs: u64,
    /// Capacity of each watch channel.
    pub watch_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            topic_prefix: "zwave".to_string(),
            request_timeout_secs: 10,
            watch_buffer: 16,
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// `<config dir>/zwave-bridge/config.toml`, or the working directory
    /// when the platform has no config dir.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(io_err)?;
        Ok(())
    }

    /// Writes a default config file at `path` if none exists yet.
    pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if !exists {
            info!("Creating default configuration at {}", path.display());
            AppConfig::default().save(path).await?;
        }
        Ok(())
    }
}
