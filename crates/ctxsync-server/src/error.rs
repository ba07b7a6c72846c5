use crate::session::ConnectionState;
use ctxsync_core::{MessageKind, StoreError, SyncError};
use thiserror::Error;

/// Errors raised while serving WebSocket connections.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("{0} is not a project change and cannot be published")]
    NotAChange(MessageKind),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
