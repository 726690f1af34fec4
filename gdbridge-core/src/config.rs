//! Server configuration.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest packet size accepted. A `g` reply alone takes 136 bytes.
pub const MIN_PACKET_SIZE: usize = 256;

/// Wire transport used to carry RSP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain TCP socket, the way `target extended-remote host:port` connects.
    #[default]
    Tcp,
    /// RSP bytes carried inside WebSocket binary messages.
    WebSocket,
}

/// Settings for a [`crate::GdbServer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    /// Largest packet the server accepts, advertised in `qSupported`.
    pub packet_size: usize,
    /// Pacing of the idle reader, the accept loop and the resume poll.
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3333,
            transport: TransportKind::Tcp,
            packet_size: 2048,
            poll_interval_ms: 10,
        }
    }
}

impl ServerConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("Failed to parse server config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot work with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.packet_size >= MIN_PACKET_SIZE,
            "Packet size {} is below the minimum of {MIN_PACKET_SIZE} bytes",
            self.packet_size
        );
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
