//! ctxsync server - WebSocket transport for the sync engine
//!
//! Observers connect to one of two endpoints:
//!
//! - `/ws/context/{project}?user_id=..&since=..` for a single project
//! - `/ws/updates?user_id=..` for system-wide messages
//!
//! A project connection receives its welcome, the stored project snapshot,
//! any changes newer than `since`, and then live messages. Producers publish
//! through [`SyncHandle`].

mod config;
mod error;
mod handle;
pub mod protocol;
pub mod route;
mod server;
pub mod session;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use error::ServerError;
pub use handle::{SyncHandle, SyncStats};
pub use protocol::{ClientMessage, ProtocolError, Reply};
pub use route::{Endpoint, RouteError};
pub use server::SyncServer;
pub use session::{CloseReason, ConnectionState};
