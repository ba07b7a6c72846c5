//! Accept loop and the engine state shared by every session.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handle::SyncHandle;
use crate::route::{Endpoint, RouteError};
use crate::session::serve_connection;
use ctxsync_core::{
    ChangeLog, Dispatcher, MemoryProjectStore, ProjectStore, Registry, SledProjectStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for sessions to send their close frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State every session and producer handle works against.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) changes: ChangeLog,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) store: Arc<dyn ProjectStore>,
}

// ─────────────────────────────────────────────────────────────────────────────
// SyncServer
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket server pushing project changes to connected observers.
///
/// Producers publish through a [`SyncHandle`]; the server owns the
/// connection registry, the change log and the dispatcher worker.
pub struct SyncServer {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl SyncServer {
    /// Creates a server, opening the sled store at `store_path` if one is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let store: Arc<dyn ProjectStore> = match &config.store_path {
            Some(path) => Arc::new(SledProjectStore::open(path)?),
            None => Arc::new(MemoryProjectStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Creates a server reading snapshots from an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn ProjectStore>) -> Self {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(registry.clone(), config.queue_capacity);
        let changes = ChangeLog::new(config.history_capacity);

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                changes,
                dispatcher,
                store,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Returns a cloneable handle for publishing changes.
    pub fn handle(&self) -> SyncHandle {
        SyncHandle::new(self.shared.clone())
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.shared.config.addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("🌐 Sync server listening on ws://{}", listener.local_addr()?);
        self.shared.dispatcher.start().await?;

        let mut sessions = JoinSet::new();
        loop {
            select! {
                () = self.shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("🔌 New connection from {}", addr);
                        let shared = self.shared.clone();
                        let shutdown = self.shutdown.child_token();

                        sessions.spawn(async move {
                            let result = accept_connection(stream, addr, shared, shutdown).await;
                            if let Err(e) = result {
                                warn!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down, closing {} session(s)", sessions.len());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Sessions did not close in time, aborting the rest");
            sessions.shutdown().await;
        }

        let leftover = self.shared.registry.disconnect_all().await;
        let dropped = self.shared.dispatcher.stop().await?;
        info!(leftover, dropped, "Sync server stopped");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let mut endpoint = None;
    let handshake = accept_hdr_async(stream, |request: &Request, response: Response| {
        let uri = request.uri();
        match Endpoint::resolve(uri.path(), uri.query()) {
            Ok(resolved) => {
                endpoint = Some(resolved);
                Ok(response)
            }
            Err(e) => Err(reject(&e)),
        }
    })
    .await;

    let ws = match handshake {
        Ok(ws) => ws,
        Err(WsError::Http(response)) => {
            debug!(%addr, status = %response.status(), "Handshake rejected");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    match endpoint {
        Some(endpoint) => serve_connection(ws, addr, endpoint, shared, shutdown).await,
        None => Ok(()),
    }
}

fn reject(error: &RouteError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = match error {
        RouteError::NotFound(_) => StatusCode::NOT_FOUND,
        RouteError::BadQuery(_) => StatusCode::BAD_REQUEST,
    };
    response
}
