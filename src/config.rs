//! Server configuration

use crate::storage::ExpiryConfig;
use crate::{DEFAULT_HOST, DEFAULT_MAX_WORKERS, DEFAULT_PORT, DEFAULT_SNAPSHOT_FILE};
use std::path::PathBuf;

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Connections served at the same time; further ones wait for a slot
    pub max_workers: usize,
    /// Snapshot file used by `SAVE`, `BGSAVE` and startup load
    pub snapshot_path: PathBuf,
    /// Active expiry tuning
    pub expiry: ExpiryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_workers: DEFAULT_MAX_WORKERS,
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_FILE),
            expiry: ExpiryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
