//! Error types for the synchronization core.

use thiserror::Error;

/// Errors surfaced by the change log, registry and dispatcher.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Broadcast queue is full ({capacity} messages pending)")]
    QueueFull { capacity: usize },

    #[error("Broadcast queue is closed")]
    QueueClosed,

    #[error("Dispatcher is already running")]
    DispatcherRunning,

    #[error("Dispatcher worker exited abnormally: {0}")]
    DispatcherStopped(String),

    #[error("Welcome could not be delivered: {0}")]
    WelcomeFailed(#[from] DeliveryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a frame could not be handed to a connection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection is not draining its outbox fast enough.
    #[error("outbox full")]
    Full,

    /// The session owning the socket is gone.
    #[error("outbox closed")]
    Closed,
}

/// Errors from a [`ProjectStore`](crate::store::ProjectStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
