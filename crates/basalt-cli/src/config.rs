//! Host configuration file.
//!
//! One TOML file carries the listener, the database location, the runtime
//! settings and the module bootstrap table:
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [storage]
//! path = "data/basalt.redb"
//!
//! [runtime]
//! handler_timeout_ms = 5000
//!
//! [extensions]
//! load_order = ["heartbeat"]
//!
//! [extensions.modules.heartbeat]
//! enabled = true
//! config = { interval_secs = 30 }
//! ```

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use basalt_core::{ExtensionsConfig, RuntimeConfig};
use basalt_storage::StorageConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "basalt.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9380,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub extensions: ExtensionsConfig,
}

impl HostConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.runtime
            .validate()
            .map_err(|e| anyhow::anyhow!("runtime: {e}"))?;
        self.server.socket_addr()?;
        Ok(())
    }
}
