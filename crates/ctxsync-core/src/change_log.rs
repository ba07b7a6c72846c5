//! Bounded, per-project history of recorded changes.
//!
//! Clients reconnecting with a watermark replay everything newer than it from
//! here. Only the most recent `capacity` records per project are retained;
//! a watermark older than the retained window silently receives the window
//! alone. Use [`ChangeLog::oldest_retained_id`] to detect that case.

use crate::message::MessageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Default number of records retained per project.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// One recorded state mutation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Strictly increasing per project, starting at 1.
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub project_name: String,
    pub data: Value,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub uuid: Uuid,
}

#[derive(Debug, Default)]
struct ProjectHistory {
    /// Id of the newest record ever assigned. Survives eviction.
    last_id: u64,
    records: VecDeque<Arc<ChangeRecord>>,
}

/// Thread-safe change log keyed by project name.
#[derive(Debug)]
pub struct ChangeLog {
    capacity: usize,
    projects: RwLock<HashMap<String, ProjectHistory>>,
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ChangeLog {
    /// Creates a change log retaining at most `capacity` records per project.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            projects: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a change for `project_name` and returns the created record.
    pub async fn record_change(
        &self,
        project_name: &str,
        kind: MessageKind,
        data: Value,
        user_id: Option<&str>,
    ) -> Arc<ChangeRecord> {
        let mut projects = self.projects.write().await;
        let history = projects.entry(project_name.to_string()).or_default();

        history.last_id += 1;
        let record = Arc::new(ChangeRecord {
            id: history.last_id,
            kind,
            project_name: project_name.to_string(),
            data,
            user_id: user_id.map(str::to_string),
            timestamp: Utc::now(),
            uuid: Uuid::new_v4(),
        });

        history.records.push_back(record.clone());
        while history.records.len() > self.capacity {
            history.records.pop_front();
        }

        debug!(
            project = project_name,
            id = record.id,
            kind = %kind,
            "Recorded change"
        );
        record
    }

    /// Returns retained records with `id > since_id`, oldest first.
    pub async fn get_changes_since(
        &self,
        project_name: &str,
        since_id: u64,
    ) -> Vec<Arc<ChangeRecord>> {
        let projects = self.projects.read().await;
        let Some(history) = projects.get(project_name) else {
            return Vec::new();
        };

        if since_id >= history.last_id {
            return Vec::new();
        }

        // Ids are contiguous within the window, so the first match is found
        // by offset rather than by scanning.
        let oldest = history.records.front().map(|r| r.id).unwrap_or(0);
        let skip = since_id.saturating_sub(oldest.saturating_sub(1)) as usize;
        history.records.iter().skip(skip).cloned().collect()
    }

    /// Id of the newest record ever recorded for the project, or 0.
    pub async fn get_latest_change_id(&self, project_name: &str) -> u64 {
        self.projects
            .read()
            .await
            .get(project_name)
            .map(|h| h.last_id)
            .unwrap_or(0)
    }

    /// Id of the oldest record still retained for the project.
    pub async fn oldest_retained_id(&self, project_name: &str) -> Option<u64> {
        self.projects
            .read()
            .await
            .get(project_name)
            .and_then(|h| h.records.front())
            .map(|r| r.id)
    }

    /// Names of all projects with recorded history.
    pub async fn projects(&self) -> Vec<String> {
        let mut names: Vec<_> = self.projects.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn record_n(log: &ChangeLog, project: &str, n: usize) {
        for i in 0..n {
            log.record_change(project, MessageKind::ContextUpdated, json!({ "i": i }), None)
                .await;
        }
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let log = ChangeLog::default();

        let first = log
            .record_change("demo", MessageKind::GoalChanged, json!({}), Some("alice"))
            .await;
        let second = log
            .record_change("demo", MessageKind::FeatureCompleted, json!({}), None)
            .await;

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.user_id.as_deref(), Some("alice"));
        assert_ne!(first.uuid, second.uuid);
    }

    #[tokio::test]
    async fn test_projects_have_independent_counters() {
        let log = ChangeLog::default();
        record_n(&log, "a", 3).await;
        let b = log
            .record_change("b", MessageKind::IssueResolved, json!({}), None)
            .await;

        assert_eq!(b.id, 1);
        assert_eq!(log.get_latest_change_id("a").await, 3);
        assert_eq!(log.get_latest_change_id("b").await, 1);
    }

    #[tokio::test]
    async fn test_changes_since_is_ordered() {
        let log = ChangeLog::default();
        record_n(&log, "demo", 10).await;

        let all = log.get_changes_since("demo", 0).await;
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let tail = log.get_changes_since("demo", 7).await;
        let ids: Vec<_> = tail.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn test_unknown_project_and_future_watermark() {
        let log = ChangeLog::default();
        record_n(&log, "demo", 2).await;

        assert!(log.get_changes_since("nope", 0).await.is_empty());
        assert_eq!(log.get_latest_change_id("nope").await, 0);
        assert!(log.get_changes_since("demo", 2).await.is_empty());
        assert!(log.get_changes_since("demo", 500).await.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_keeps_counter() {
        let log = ChangeLog::new(100);
        record_n(&log, "demo", 101).await;

        let retained = log.get_changes_since("demo", 0).await;
        assert_eq!(retained.len(), 100);
        assert_eq!(retained.first().unwrap().id, 2);
        assert_eq!(retained.last().unwrap().id, 101);
        assert_eq!(log.get_latest_change_id("demo").await, 101);
        assert_eq!(log.oldest_retained_id("demo").await, Some(2));
    }

    #[tokio::test]
    async fn test_stale_watermark_gets_retained_window_only() {
        let log = ChangeLog::new(5);
        record_n(&log, "demo", 12).await;

        let replay = log.get_changes_since("demo", 3).await;
        let ids: Vec<_> = replay.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![8, 9, 10, 11, 12]);

        let partial = log.get_changes_since("demo", 9).await;
        let ids: Vec<_> = partial.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_concurrent_records_have_no_gaps() {
        let log = Arc::new(ChangeLog::new(1000));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move { record_n(&log, "demo", 25).await }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let ids: Vec<_> = log
            .get_changes_since("demo", 0)
            .await
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn test_record_serialization() {
        let record = ChangeRecord {
            id: 4,
            kind: MessageKind::GoalChanged,
            project_name: "demo".into(),
            data: json!({ "new_goal": "ship" }),
            user_id: None,
            timestamp: Utc::now(),
            uuid: Uuid::new_v4(),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "goal_changed");
        assert_eq!(json["id"], 4);
        assert!(json["uuid"].is_string());
    }
}
