//! ctxsync core - real-time synchronization engine
//!
//! This crate holds the transport-independent half of ctxsync:
//!
//! - [`message`]: the closed set of events pushed to observers
//! - [`change_log`]: bounded per-project history used for reconnect catch-up
//! - [`registry`]: live connections grouped by project scope
//! - [`dispatcher`]: the single serialized worker that fans messages out
//! - [`store`]: the persistence collaborator the engine reads snapshots from
//!
//! # Example
//!
//! ```no_run
//! use ctxsync_core::{ChangeLog, Dispatcher, Message, MessageKind, Registry};
//! use std::sync::Arc;
//!
//! # async fn run() -> ctxsync_core::Result<()> {
//! let registry = Arc::new(Registry::new());
//! let changes = ChangeLog::default();
//! let dispatcher = Dispatcher::new(registry.clone(), 1024);
//! dispatcher.start().await?;
//!
//! // After a successful mutation:
//! let msg = Message::goal_changed("demo", Some("alice"), "v1", "v2");
//! changes
//!     .record_change("demo", MessageKind::GoalChanged, msg.event.payload()?, Some("alice"))
//!     .await;
//! dispatcher.queue_message(msg)?;
//! # Ok(())
//! # }
//! ```

pub mod change_log;
pub mod dispatcher;
mod error;
pub mod message;
pub mod registry;
pub mod store;

pub use change_log::{ChangeLog, ChangeRecord, DEFAULT_HISTORY_CAPACITY};
pub use dispatcher::{Dispatcher, DispatcherStats, DEFAULT_QUEUE_CAPACITY};
pub use error::{DeliveryError, Result, StoreError, SyncError};
pub use message::{Event, Frame, Message, MessageKind};
pub use registry::{
    Connection, ConnectionId, Outbox, ProjectStats, Registry, RegistryStats, Scope,
    DEFAULT_OUTBOX_CAPACITY,
};
pub use store::{MemoryProjectStore, ProjectStore, SledProjectStore};
