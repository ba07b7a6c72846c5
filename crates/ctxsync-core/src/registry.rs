//! Registry of live connections, grouped by project scope.
//!
//! The registry owns one record per connection and routes broadcasts to the
//! connections of a scope. It never touches sockets: every connection is
//! reached through its [`Outbox`], a bounded channel drained by the session
//! task that owns the socket. Handing a frame to an outbox never waits, so
//! a slow recipient cannot stall a broadcast. A recipient whose outbox is
//! full or closed is disconnected once the broadcast has finished.

use crate::error::{DeliveryError, Result};
use crate::message::{Frame, Message};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default per-connection outbox capacity.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Opaque identity of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broadcast target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Project(String),
}

impl Scope {
    pub fn from_project(project_name: Option<&str>) -> Self {
        match project_name {
            Some(name) => Scope::Project(name.to_string()),
            None => Scope::Global,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Project(name) => write!(f, "project:{}", name),
        }
    }
}

/// Sending half of a connection's outbound frame queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
}

impl Outbox {
    /// Creates an outbox and the receiver the socket writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Hands a frame to the connection without waiting.
    pub fn deliver(&self, frame: Frame) -> std::result::Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Snapshot of a registered connection.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: ConnectionId,
    /// `None` means the connection listens on the global scope.
    pub project_scope: Option<String>,
    pub user_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl Connection {
    pub fn scope(&self) -> Scope {
        Scope::from_project(self.project_scope.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectStats {
    pub connection_count: usize,
    pub users: Vec<String>,
}

/// Connection counts and membership per scope.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub global_connections: usize,
    pub project_connections: BTreeMap<String, ProjectStats>,
    pub active_projects: Vec<String>,
}

struct Entry {
    connection: Connection,
    outbox: Outbox,
}

#[derive(Default)]
struct State {
    entries: HashMap<ConnectionId, Entry>,
    projects: HashMap<String, HashSet<ConnectionId>>,
    global: HashSet<ConnectionId>,
}

impl State {
    fn members(&self, scope: &Scope) -> Option<&HashSet<ConnectionId>> {
        match scope {
            Scope::Global => Some(&self.global),
            Scope::Project(name) => self.projects.get(name),
        }
    }

    fn insert(&mut self, connection: Connection, outbox: Outbox) {
        let id = connection.id;
        match &connection.project_scope {
            Some(project) => {
                self.projects.entry(project.clone()).or_default().insert(id);
            }
            None => {
                self.global.insert(id);
            }
        }
        self.entries.insert(id, Entry { connection, outbox });
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let entry = self.entries.remove(&id)?;
        match &entry.connection.project_scope {
            Some(project) => {
                if let Some(set) = self.projects.get_mut(project) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.projects.remove(project);
                    }
                }
            }
            None => {
                self.global.remove(&id);
            }
        }
        Some(entry.connection)
    }
}

/// Live connection registry.
#[derive(Default)]
pub struct Registry {
    state: RwLock<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and sends it the welcome acknowledgment.
    ///
    /// Project-scoped connections are announced to the peers already in the
    /// project. Fails without registering anything if the welcome cannot be
    /// handed to `outbox`.
    pub async fn connect(
        &self,
        outbox: Outbox,
        project_name: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Connection> {
        let now = Utc::now();
        let connection = Connection {
            id: ConnectionId::new(),
            project_scope: project_name.map(str::to_string),
            user_id: user_id.map(str::to_string),
            connected_at: now,
            last_heartbeat: now,
            metadata: HashMap::new(),
        };

        let welcome = Message::welcome(project_name, user_id, now).encode()?;
        {
            let mut state = self.state.write().await;
            // Delivered before insertion so no broadcast can overtake it.
            outbox.deliver(welcome)?;
            state.insert(connection.clone(), outbox);
        }

        debug!(
            connection = %connection.id,
            scope = %connection.scope(),
            user = user_id.unwrap_or("-"),
            "Connection registered"
        );

        if let Some(project) = project_name {
            let joined = Message::user_joined(project, user_id, now);
            let new_id = connection.id;
            self.fan_out(&Scope::Project(project.to_string()), &joined, |c| {
                c.id == new_id || (user_id.is_some() && c.user_id.as_deref() == user_id)
            })
            .await;
        }

        Ok(connection)
    }

    /// Removes a connection and announces its departure to its project.
    ///
    /// Returns `false` if the connection was already gone.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.state.write().await.remove(id);
        match removed {
            Some(connection) => {
                self.announce_departures(vec![connection]).await;
                true
            }
            None => false,
        }
    }

    /// Disconnects every registered connection. Returns how many there were.
    pub async fn disconnect_all(&self) -> usize {
        let ids: Vec<_> = self.state.read().await.entries.keys().copied().collect();
        let mut count = 0;
        for id in ids {
            if self.disconnect(id).await {
                count += 1;
            }
        }
        count
    }

    /// Delivers `message` to every connection in `project_name`, skipping
    /// connections of `exclude_user`. Returns the number of recipients.
    pub async fn broadcast_to_project(
        &self,
        project_name: &str,
        message: &Message,
        exclude_user: Option<&str>,
    ) -> usize {
        self.fan_out(&Scope::Project(project_name.to_string()), message, |c| {
            exclude_user.is_some() && c.user_id.as_deref() == exclude_user
        })
        .await
    }

    /// Delivers `message` to every globally scoped connection.
    pub async fn broadcast_global(&self, message: &Message) -> usize {
        self.fan_out(&Scope::Global, message, |_| false).await
    }

    /// Refreshes a connection's heartbeat timestamp.
    pub async fn touch(&self, id: ConnectionId) -> bool {
        match self.state.write().await.entries.get_mut(&id) {
            Some(entry) => {
                entry.connection.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn set_metadata(&self, id: ConnectionId, key: &str, value: Value) -> bool {
        match self.state.write().await.entries.get_mut(&id) {
            Some(entry) => {
                entry.connection.metadata.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.state
            .read()
            .await
            .entries
            .get(&id)
            .map(|e| e.connection.clone())
    }

    /// Connections currently scoped to `project_name`, oldest first.
    pub async fn project_members(&self, project_name: &str) -> Vec<Connection> {
        let state = self.state.read().await;
        let mut members: Vec<_> = state
            .projects
            .get(project_name)
            .into_iter()
            .flatten()
            .filter_map(|id| state.entries.get(id))
            .map(|e| e.connection.clone())
            .collect();
        members.sort_by_key(|c| c.connected_at);
        members
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let state = self.state.read().await;

        let project_connections: BTreeMap<_, _> = state
            .projects
            .iter()
            .map(|(name, ids)| {
                let mut users: Vec<String> = ids
                    .iter()
                    .filter_map(|id| state.entries.get(id))
                    .filter_map(|e| e.connection.user_id.clone())
                    .collect();
                users.sort();
                (
                    name.clone(),
                    ProjectStats {
                        connection_count: ids.len(),
                        users,
                    },
                )
            })
            .collect();

        RegistryStats {
            total_connections: state.entries.len(),
            global_connections: state.global.len(),
            active_projects: project_connections.keys().cloned().collect(),
            project_connections,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fan-out
    // ─────────────────────────────────────────────────────────────────────

    /// Delivers to a scope, then evicts the recipients that failed.
    async fn fan_out(
        &self,
        scope: &Scope,
        message: &Message,
        skip: impl Fn(&Connection) -> bool,
    ) -> usize {
        let (delivered, failed) = self.deliver_to_scope(scope, message, skip).await;
        if !failed.is_empty() {
            let departed = self.remove_all(&failed).await;
            self.announce_departures(departed).await;
        }
        delivered
    }

    /// Attempts delivery to a snapshot of the scope's membership.
    ///
    /// The membership is copied out under the read lock; the lock is not held
    /// while delivering. Returns the delivered count and the failed ids.
    async fn deliver_to_scope(
        &self,
        scope: &Scope,
        message: &Message,
        skip: impl Fn(&Connection) -> bool,
    ) -> (usize, Vec<ConnectionId>) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(scope = %scope, "Failed to encode {} message: {}", message.kind(), e);
                return (0, Vec::new());
            }
        };

        let targets: Vec<(ConnectionId, Outbox)> = {
            let state = self.state.read().await;
            state
                .members(scope)
                .into_iter()
                .flatten()
                .filter_map(|id| state.entries.get(id))
                .filter(|e| !skip(&e.connection))
                .map(|e| (e.connection.id, e.outbox.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, outbox) in targets {
            match outbox.deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection = %id, scope = %scope, "Delivery failed: {}", e);
                    failed.push(id);
                }
            }
        }

        debug!(
            scope = %scope,
            kind = %message.kind(),
            delivered,
            failed = failed.len(),
            "Broadcast complete"
        );
        (delivered, failed)
    }

    async fn remove_all(&self, ids: &[ConnectionId]) -> Vec<Connection> {
        let mut state = self.state.write().await;
        ids.iter().filter_map(|id| state.remove(*id)).collect()
    }

    /// Publishes `user_left` for each departed project connection.
    ///
    /// Recipients failing these notifications are removed and announced in
    /// turn, worked off iteratively until nothing is left.
    async fn announce_departures(&self, mut departed: Vec<Connection>) {
        while let Some(connection) = departed.pop() {
            info!(
                connection = %connection.id,
                scope = %connection.scope(),
                user = connection.user_id.as_deref().unwrap_or("-"),
                "Connection removed"
            );

            let Some(project) = connection.project_scope.as_deref() else {
                continue;
            };
            let left = Message::user_left(project, connection.user_id.as_deref());
            let (_, failed) = self
                .deliver_to_scope(&Scope::Project(project.to_string()), &left, |_| false)
                .await;
            if !failed.is_empty() {
                departed.extend(self.remove_all(&failed).await);
            }
        }
    }
}
