//! Producer-facing API.
//!
//! Request handlers call into a [`SyncHandle`] after a successful mutation.
//! Every publish records the change first and then queues the broadcast, so
//! a client that misses the live message can still replay it.

use crate::error::ServerError;
use crate::server::Shared;
use ctxsync_core::{
    ChangeRecord, DispatcherStats, Event, Message, MessageKind, RegistryStats, SyncError,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub connections: RegistryStats,
    pub dispatcher: DispatcherStats,
    /// Projects with at least one recorded change.
    pub projects_with_history: Vec<String>,
    /// Records retained per project.
    pub history_capacity: usize,
}

/// Cloneable handle for publishing changes. Never touches sockets.
#[derive(Clone)]
pub struct SyncHandle {
    shared: Arc<Shared>,
}

impl SyncHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Appends a change record without broadcasting it.
    pub async fn record_change(
        &self,
        project_name: &str,
        kind: MessageKind,
        data: Value,
        user_id: Option<&str>,
    ) -> Arc<ChangeRecord> {
        self.shared
            .changes
            .record_change(project_name, kind, data, user_id)
            .await
    }

    /// Queues a message for broadcast without recording it.
    pub fn queue_message(&self, message: Message) -> Result<(), SyncError> {
        self.shared.dispatcher.queue_message(message)
    }

    /// Records `event` for `project_name` and queues it for broadcast.
    ///
    /// Only project mutations are accepted; presence, heartbeat and error
    /// events fail with [`ServerError::NotAChange`] and nothing is recorded.
    /// When the queue is full the change stays recorded and the error is
    /// returned; clients pick it up on their next catch-up.
    pub async fn publish(
        &self,
        project_name: &str,
        user_id: Option<&str>,
        event: Event,
    ) -> Result<Arc<ChangeRecord>, ServerError> {
        if !event.kind().is_change() {
            return Err(ServerError::NotAChange(event.kind()));
        }
        let message = Message::new(
            event,
            Some(project_name.to_string()),
            user_id.map(str::to_string),
        );
        self.record_and_queue(project_name, message).await
    }

    pub async fn goal_changed(
        &self,
        project_name: &str,
        user_id: Option<&str>,
        old_goal: &str,
        new_goal: &str,
    ) -> Result<Arc<ChangeRecord>, ServerError> {
        let message = Message::goal_changed(project_name, user_id, old_goal, new_goal);
        self.record_and_queue(project_name, message).await
    }

    pub async fn feature_completed(
        &self,
        project_name: &str,
        user_id: Option<&str>,
        feature: &str,
    ) -> Result<Arc<ChangeRecord>, ServerError> {
        let message = Message::feature_completed(project_name, user_id, feature);
        self.record_and_queue(project_name, message).await
    }

    pub async fn issue_resolved(
        &self,
        project_name: &str,
        user_id: Option<&str>,
        issue: &str,
    ) -> Result<Arc<ChangeRecord>, ServerError> {
        let message = Message::issue_resolved(project_name, user_id, issue);
        self.record_and_queue(project_name, message).await
    }

    pub async fn context_updated(
        &self,
        project_name: &str,
        user_id: Option<&str>,
        changes: Value,
    ) -> Result<Arc<ChangeRecord>, ServerError> {
        let message = Message::context_updated(project_name, user_id, changes);
        self.record_and_queue(project_name, message).await
    }

    pub async fn latest_change_id(&self, project_name: &str) -> u64 {
        self.shared.changes.get_latest_change_id(project_name).await
    }

    pub async fn stats(&self) -> SyncStats {
        SyncStats {
            connections: self.shared.registry.get_stats().await,
            dispatcher: self.shared.dispatcher.stats().await,
            projects_with_history: self.shared.changes.projects().await,
            history_capacity: self.shared.changes.capacity(),
        }
    }

    async fn record_and_queue(
        &self,
        project_name: &str,
        message: Message,
    ) -> Result<Arc<ChangeRecord>, ServerError> {
        let data = message.event.payload()?;
        let record = self
            .record_change(project_name, message.kind(), data, message.user_id.as_deref())
            .await;
        self.queue_message(message)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServerConfig, SyncServer};
    use ctxsync_core::MemoryProjectStore;
    use serde_json::json;

    fn handle_with_queue(queue_capacity: usize) -> SyncHandle {
        let config = ServerConfig {
            queue_capacity,
            ..Default::default()
        };
        SyncServer::with_store(config, Arc::new(MemoryProjectStore::new())).handle()
    }

    #[tokio::test]
    async fn test_publish_records_then_queues() {
        let handle = handle_with_queue(8);

        let record = handle
            .goal_changed("demo", Some("alice"), "v1", "v2")
            .await
            .unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.kind, MessageKind::GoalChanged);
        assert_eq!(record.data["new_goal"], "v2");
        assert_eq!(record.user_id.as_deref(), Some("alice"));

        let stats = handle.stats().await;
        assert_eq!(stats.dispatcher.queued, 1);
        assert_eq!(stats.projects_with_history, vec!["demo"]);
        assert_eq!(stats.history_capacity, 100);
        assert_eq!(handle.latest_change_id("demo").await, 1);
    }

    #[tokio::test]
    async fn test_full_queue_still_records() {
        let handle = handle_with_queue(1);

        handle.feature_completed("demo", None, "login").await.unwrap();
        let err = handle
            .context_updated("demo", None, json!({ "next_steps": [] }))
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Sync(SyncError::QueueFull { .. })));
        assert_eq!(handle.latest_change_id("demo").await, 2);
    }

    #[tokio::test]
    async fn test_publish_rejects_transient_events() {
        let handle = handle_with_queue(8);

        let err = handle
            .publish("demo", None, Message::heartbeat(None).event)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotAChange(MessageKind::Heartbeat)));

        let err = handle
            .publish("demo", Some("bob"), Message::error(Some("demo"), "boom").event)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotAChange(MessageKind::Error)));

        assert_eq!(handle.latest_change_id("demo").await, 0);
        assert_eq!(handle.stats().await.dispatcher.queued, 0);

        let record = handle
            .publish(
                "demo",
                Some("bob"),
                Message::issue_resolved("demo", None, "flaky test").event,
            )
            .await
            .unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.user_id.as_deref(), Some("bob"));
    }
}
