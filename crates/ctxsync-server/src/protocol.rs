//! Control messages exchanged directly with a single client.
//!
//! These never go through the dispatcher: requests are answered on the
//! socket they arrived on, and the greeting frames (`initial_state`,
//! `missed_changes`, `initial_system_state`) are written before the session
//! starts draining its outbox.

use chrono::{DateTime, Utc};
use ctxsync_core::{ChangeRecord, DispatcherStats, RegistryStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Client -> server
// ─────────────────────────────────────────────────────────────────────────────

/// Requests a client may send over an open connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    /// Replay of recorded changes newer than `since`.
    GetChanges {
        #[serde(default)]
        since: u64,
    },
    Heartbeat,
    GetStats,
    #[serde(other)]
    Unknown,
}

/// Why an inbound text frame was not understood.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON message")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Message is missing a string \"type\" field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} message: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientMessage {
    /// Parses one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        match serde_json::from_value(value) {
            Ok(ClientMessage::Unknown) => Err(ProtocolError::UnknownType(kind)),
            Ok(message) => Ok(message),
            Err(source) => Err(ProtocolError::InvalidFields { kind, source }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server -> client
// ─────────────────────────────────────────────────────────────────────────────

/// Frames written to a single client outside the broadcast path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Pong {
        timestamp: DateTime<Utc>,
    },
    /// Answer to `get_changes`.
    Changes {
        project_name: String,
        changes: Vec<Arc<ChangeRecord>>,
        latest_change_id: u64,
        timestamp: DateTime<Utc>,
    },
    /// Catch-up sent once on connect when the watermark is behind.
    MissedChanges {
        project_name: String,
        changes: Vec<Arc<ChangeRecord>>,
        latest_change_id: u64,
        timestamp: DateTime<Utc>,
    },
    /// Stored snapshot of the project, sent once on connect.
    InitialState {
        project_name: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },
    /// Project listing sent once to global observers.
    InitialSystemState {
        projects: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    HeartbeatResponse {
        timestamp: DateTime<Utc>,
    },
    ConnectionStats {
        connections: RegistryStats,
        dispatcher: DispatcherStats,
        timestamp: DateTime<Utc>,
    },
}

impl Reply {
    pub fn pong() -> Self {
        Reply::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat_response() -> Self {
        Reply::HeartbeatResponse {
            timestamp: Utc::now(),
        }
    }

    pub fn changes(project_name: &str, changes: Vec<Arc<ChangeRecord>>, latest: u64) -> Self {
        Reply::Changes {
            project_name: project_name.to_string(),
            changes,
            latest_change_id: latest,
            timestamp: Utc::now(),
        }
    }

    pub fn missed_changes(
        project_name: &str,
        changes: Vec<Arc<ChangeRecord>>,
        latest: u64,
    ) -> Self {
        Reply::MissedChanges {
            project_name: project_name.to_string(),
            changes,
            latest_change_id: latest,
            timestamp: Utc::now(),
        }
    }

    pub fn initial_state(project_name: &str, data: Value) -> Self {
        Reply::InitialState {
            project_name: project_name.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn initial_system_state(projects: Vec<String>) -> Self {
        Reply::InitialSystemState {
            projects,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_stats(connections: RegistryStats, dispatcher: DispatcherStats) -> Self {
        Reply::ConnectionStats {
            connections,
            dispatcher,
            timestamp: Utc::now(),
        }
    }
}
