//! Server configuration.
//!
//! Every field has a default, so a config file only needs to list what it
//! overrides:
//!
//! ```json
//! { "addr": "0.0.0.0:8765", "store_path": ".ctxsync/store" }
//! ```

use crate::error::ServerError;
use ctxsync_core::{DEFAULT_HISTORY_CAPACITY, DEFAULT_OUTBOX_CAPACITY, DEFAULT_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 8765;

/// Runtime configuration for [`SyncServer`](crate::SyncServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener.
    pub addr: SocketAddr,
    /// Change records retained per project for catch-up.
    pub history_capacity: usize,
    /// Messages the dispatcher buffers before rejecting new ones.
    pub queue_capacity: usize,
    /// Frames buffered per connection before it is evicted as slow.
    pub outbox_capacity: usize,
    /// Seconds of client silence before the server sends a heartbeat.
    pub heartbeat_interval_secs: u64,
    /// Seconds of client silence before the connection is closed.
    pub idle_timeout_secs: u64,
    /// Directory of the sled project store. `None` keeps projects in memory.
    pub store_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            store_path: None,
        }
    }
}

impl ServerConfig {
    /// Reads a JSON config file. Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ServerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        let checks = [
            (self.history_capacity == 0, "history_capacity must be at least 1"),
            (self.queue_capacity == 0, "queue_capacity must be at least 1"),
            (self.outbox_capacity == 0, "outbox_capacity must be at least 1"),
            (self.heartbeat_interval_secs == 0, "heartbeat_interval_secs must be at least 1"),
            (
                self.idle_timeout_secs < self.heartbeat_interval_secs,
                "idle_timeout_secs must not be shorter than heartbeat_interval_secs",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ServerError::Config(reason.to_string())),
            None => Ok(()),
        }
    }
}
