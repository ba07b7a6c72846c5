//! Lifecycle of a single WebSocket connection.
//!
//! A session registers its outbox with the registry, forwards the welcome,
//! writes the greeting frames, then loops over four sources until one of
//! them ends it: inbound frames, outbox frames, the heartbeat/idle timers
//! and the server's shutdown token. Whatever ends the loop, the connection
//! is removed from the registry before the task exits.

use crate::error::ServerError;
use crate::protocol::{ClientMessage, Reply};
use crate::route::Endpoint;
use crate::server::Shared;
use ctxsync_core::{Connection, Frame, Message, Outbox};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, welcome not yet on the wire.
    Connecting,
    /// Receiving live messages.
    Active,
    /// Shutting down; no further messages are delivered.
    Closing,
    /// Removed from the registry. Terminal.
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Active) | (Connecting, Closing) | (Active, Closing) | (Closing, Closed)
        )
    }

    /// Returns `next` if the move is legal.
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState, ServerError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ServerError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Close reasons and timers
// ─────────────────────────────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame or dropped the socket.
    PeerClosed,
    /// Nothing arrived from the client within the idle timeout.
    IdleTimeout,
    /// The registry dropped the connection after a failed delivery.
    Evicted,
    ServerShutdown,
    Error(String),
}

impl CloseReason {
    fn close_frame(&self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            CloseReason::PeerClosed => return None,
            CloseReason::IdleTimeout => (CloseCode::Normal, Cow::Borrowed("no client activity")),
            CloseReason::Evicted => (CloseCode::Policy, Cow::Borrowed("connection fell behind")),
            CloseReason::ServerShutdown => {
                (CloseCode::Restart, Cow::Borrowed("server is shutting down"))
            }
            CloseReason::Error(message) => (CloseCode::Error, Cow::Owned(message.clone())),
        };
        Some(CloseFrame { code, reason })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Evicted => f.write_str("evicted"),
            CloseReason::ServerShutdown => f.write_str("server shutdown"),
            CloseReason::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// Deadline pushed back whenever the client shows activity.
struct ActivityTimer {
    duration: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl ActivityTimer {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            sleep: Box::pin(sleep(duration)),
        }
    }

    fn wait(&mut self) -> impl Future<Output = ()> + '_ {
        &mut self.sleep
    }

    fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.duration);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct Session<S> {
    ws: S,
    addr: SocketAddr,
    connection: Connection,
    outbox: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    state: ConnectionState,
}

/// Serves one upgraded connection until it closes.
pub(crate) async fn serve_connection<S>(
    mut ws: S,
    addr: SocketAddr,
    endpoint: Endpoint,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<(), ServerError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    let (outbox, outbox_rx) = Outbox::channel(shared.config.outbox_capacity);
    let registered = shared
        .registry
        .connect(
            outbox,
            endpoint.project_name.as_deref(),
            endpoint.user_id.as_deref(),
        )
        .await;

    let connection = match registered {
        Ok(connection) => connection,
        Err(e) => {
            warn!(%addr, error = %e, "Registration failed");
            let reason = CloseReason::Error(e.to_string());
            if let Err(send_err) = ws.send(WsMessage::Close(reason.close_frame())).await {
                debug!(%addr, error = %send_err, "Failed to send close frame");
            }
            return Err(e.into());
        }
    };

    info!(
        %addr,
        id = %connection.id,
        scope = %connection.scope(),
        user = connection.user_id.as_deref().unwrap_or("-"),
        "Connection opened"
    );

    let mut session = Session {
        ws,
        addr,
        connection,
        outbox: outbox_rx,
        shared,
        state: ConnectionState::Connecting,
    };

    let outcome = session.run(endpoint.since, shutdown).await;
    let reason = match &outcome {
        Ok(reason) => reason.clone(),
        Err(e) => CloseReason::Error(e.to_string()),
    };

    session.advance(ConnectionState::Closing);
    session.close(&reason).await;
    session.shared.registry.disconnect(session.connection.id).await;
    session.advance(ConnectionState::Closed);

    info!(
        addr = %session.addr,
        id = %session.connection.id,
        %reason,
        "Connection closed"
    );
    outcome.map(|_| ())
}

impl<S> Session<S>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    fn advance(&mut self, next: ConnectionState) {
        match self.state.transition(next) {
            Ok(state) => {
                debug!(id = %self.connection.id, from = %self.state, to = %state, "State change");
                self.state = state;
            }
            Err(e) => warn!(id = %self.connection.id, error = %e, "Ignoring state change"),
        }
    }

    async fn run(
        &mut self,
        since: u64,
        shutdown: CancellationToken,
    ) -> Result<CloseReason, ServerError> {
        // The registry queued the welcome before the connection became
        // visible to broadcasts, so it is always first in the outbox.
        if let Ok(welcome) = self.outbox.try_recv() {
            self.send_frame(welcome).await?;
        }
        self.advance(ConnectionState::Active);

        self.greet(since).await?;
        self.serve(shutdown).await
    }

    /// Writes the snapshot frames a new connection starts from.
    async fn greet(&mut self, since: u64) -> Result<(), ServerError> {
        let Some(project) = self.connection.project_scope.clone() else {
            let projects = self.known_projects().await?;
            return self.send_reply(&Reply::initial_system_state(projects)).await;
        };

        match self.load_snapshot(&project).await {
            Ok(Some(data)) => self.send_reply(&Reply::initial_state(&project, data)).await?,
            Ok(None) => {}
            Err(e) => {
                warn!(project = %project, error = %e, "Failed to load project snapshot");
                let error =
                    Message::error(Some(&project), format!("Failed to load project state: {e}"));
                self.send_message(&error).await?;
            }
        }

        let changes = &self.shared.changes;
        let missed = changes.get_changes_since(&project, since).await;
        if missed.is_empty() {
            return Ok(());
        }

        if let Some(oldest) = changes.oldest_retained_id(&project).await {
            if since.saturating_add(1) < oldest {
                debug!(
                    project = %project,
                    since,
                    oldest,
                    "Catch-up starts after the requested watermark"
                );
            }
        }
        let latest = changes.get_latest_change_id(&project).await;
        debug!(project = %project, count = missed.len(), "Replaying missed changes");
        self.send_reply(&Reply::missed_changes(&project, missed, latest)).await
    }

    async fn serve(&mut self, shutdown: CancellationToken) -> Result<CloseReason, ServerError> {
        let mut heartbeat = ActivityTimer::new(self.shared.config.heartbeat_interval());
        let mut idle = ActivityTimer::new(self.shared.config.idle_timeout());

        loop {
            select! {
                biased;

                () = shutdown.cancelled() => return Ok(CloseReason::ServerShutdown),

                // Inbound first so client activity is never starved by a
                // busy outbox.
                inbound = self.ws.next() => {
                    let message = match inbound {
                        None | Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                            return Ok(CloseReason::PeerClosed);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(message)) => message,
                    };

                    heartbeat.reset();
                    idle.reset();
                    self.shared.registry.touch(self.connection.id).await;

                    match message {
                        WsMessage::Text(text) => self.on_text(&text).await?,
                        WsMessage::Binary(_) => {
                            let error =
                                Message::error(self.project(), "Binary frames are not supported");
                            self.send_message(&error).await?;
                        }
                        WsMessage::Ping(data) => self.ws.send(WsMessage::Pong(data)).await?,
                        WsMessage::Close(frame) => {
                            debug!(id = %self.connection.id, ?frame, "Client closed connection");
                            return Ok(CloseReason::PeerClosed);
                        }
                        WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                    }
                },

                () = idle.wait() => return Ok(CloseReason::IdleTimeout),

                frame = self.outbox.recv() => match frame {
                    Some(frame) => self.send_frame(frame).await?,
                    None => return Ok(CloseReason::Evicted),
                },

                () = heartbeat.wait() => {
                    heartbeat.reset();
                    let beat = Message::heartbeat(self.project());
                    self.send_message(&beat).await?;
                },
            }
        }
    }

    async fn on_text(&mut self, text: &str) -> Result<(), ServerError> {
        debug!(id = %self.connection.id, len = text.len(), "Received client message");

        let request = match ClientMessage::parse(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(id = %self.connection.id, error = %e, "Rejected client message");
                let error = Message::error(self.project(), e);
                return self.send_message(&error).await;
            }
        };

        match request {
            ClientMessage::Ping => self.send_reply(&Reply::pong()).await,
            ClientMessage::Heartbeat => self.send_reply(&Reply::heartbeat_response()).await,
            ClientMessage::GetChanges { since } => {
                let Some(project) = self.connection.project_scope.clone() else {
                    let error = Message::error(None, "get_changes requires a project connection");
                    return self.send_message(&error).await;
                };
                let changes = self.shared.changes.get_changes_since(&project, since).await;
                let latest = self.shared.changes.get_latest_change_id(&project).await;
                self.send_reply(&Reply::changes(&project, changes, latest)).await
            }
            ClientMessage::GetStats => {
                let connections = self.shared.registry.get_stats().await;
                let dispatcher = self.shared.dispatcher.stats().await;
                self.send_reply(&Reply::connection_stats(connections, dispatcher)).await
            }
            ClientMessage::Unknown => {
                let error = Message::error(self.project(), "Unknown message type");
                self.send_message(&error).await
            }
        }
    }

    async fn close(&mut self, reason: &CloseReason) {
        let Some(frame) = reason.close_frame() else {
            return;
        };
        if let Err(e) = self.ws.send(WsMessage::Close(Some(frame))).await {
            debug!(id = %self.connection.id, error = %e, "Failed to send close frame");
        }
    }

    fn project(&self) -> Option<&str> {
        self.connection.project_scope.as_deref()
    }

    async fn load_snapshot(&self, project: &str) -> Result<Option<Value>, ServerError> {
        let store = self.shared.store.clone();
        let project = project.to_string();
        Ok(tokio::task::spawn_blocking(move || store.load_project(&project)).await??)
    }

    /// Stored projects plus any that only have recorded history.
    async fn known_projects(&mut self) -> Result<Vec<String>, ServerError> {
        let store = self.shared.store.clone();
        let mut projects: BTreeSet<String> = match tokio::task::spawn_blocking(move || {
            store.list_projects()
        })
        .await?
        {
            Ok(stored) => stored.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list projects");
                let error = Message::error(None, format!("Failed to list projects: {e}"));
                self.send_message(&error).await?;
                BTreeSet::new()
            }
        };
        projects.extend(self.shared.changes.projects().await);
        Ok(projects.into_iter().collect())
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), ServerError> {
        self.ws.send(WsMessage::Text(frame.to_string())).await?;
        Ok(())
    }

    async fn send_message(&mut self, message: &Message) -> Result<(), ServerError> {
        self.send_frame(message.encode()?).await
    }

    async fn send_reply(&mut self, reply: &Reply) -> Result<(), ServerError> {
        self.ws.send(WsMessage::Text(serde_json::to_string(reply)?)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerConfig;
    use ctxsync_core::{
        ChangeLog, Dispatcher, MemoryProjectStore, Registry, DEFAULT_HISTORY_CAPACITY,
    };
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;
    use ConnectionState::*;

    #[test]
    fn test_legal_transitions() {
        assert_eq!(Connecting.transition(Active).unwrap(), Active);
        assert_eq!(Connecting.transition(Closing).unwrap(), Closing);
        assert_eq!(Active.transition(Closing).unwrap(), Closing);
        assert_eq!(Closing.transition(Closed).unwrap(), Closed);
    }

    #[test]
    fn test_illegal_transitions() {
        let illegal = [
            (Connecting, Closed),
            (Active, Connecting),
            (Active, Closed),
            (Active, Active),
            (Closing, Active),
            (Closed, Connecting),
            (Closed, Active),
            (Closed, Closing),
        ];
        for (from, to) in illegal {
            match from.transition(to) {
                Err(ServerError::InvalidTransition { from: f, to: t }) => {
                    assert_eq!((f, t), (from, to));
                }
                other => panic!("{from} -> {to} should be rejected, got {other:?}"),
            }
        }
    }

    async fn next_text(client: &mut WebSocketStream<DuplexStream>) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_inbound_served_ahead_of_outbox_backlog() {
        let registry = Arc::new(Registry::new());
        let shared = Arc::new(Shared {
            config: ServerConfig::default(),
            registry: registry.clone(),
            changes: ChangeLog::new(DEFAULT_HISTORY_CAPACITY),
            dispatcher: Dispatcher::new(registry.clone(), 16),
            store: Arc::new(MemoryProjectStore::new()),
        });

        let (server_io, client_io) = tokio::io::duplex(1 << 20);
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let (outbox, outbox_rx) = Outbox::channel(256);
        let connection = registry
            .connect(outbox, Some("demo"), Some("alice"))
            .await
            .unwrap();
        for i in 0..100 {
            let message = Message::goal_changed("demo", None, "", &format!("goal-{i}"));
            registry.broadcast_to_project("demo", &message, None).await;
        }
        client
            .send(WsMessage::Text(r#"{"type":"ping"}"#.to_string()))
            .await
            .unwrap();

        let mut session = Session {
            ws,
            addr: "127.0.0.1:9".parse().unwrap(),
            connection,
            outbox: outbox_rx,
            shared,
            state: ConnectionState::Active,
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { session.serve(shutdown).await }
        });

        assert_eq!(next_text(&mut client).await["type"], "pong");
        assert_eq!(next_text(&mut client).await["type"], "user_joined");
        assert_eq!(next_text(&mut client).await["data"]["new_goal"], "goal-0");

        shutdown.cancel();
        assert_eq!(task.await.unwrap().unwrap(), CloseReason::ServerShutdown);
    }

    #[test]
    fn test_close_frames() {
        assert!(CloseReason::PeerClosed.close_frame().is_none());

        let frame = CloseReason::ServerShutdown.close_frame().unwrap();
        assert_eq!(frame.code, CloseCode::Restart);

        let frame = CloseReason::Error("boom".into()).close_frame().unwrap();
        assert_eq!(frame.code, CloseCode::Error);
        assert_eq!(frame.reason, "boom");
    }
}
