//! Message model for the real-time channel.
//!
//! Every message pushed to observers is one of a closed set of [`Event`]s,
//! wrapped in a [`Message`] envelope carrying routing and identity fields.
//! On the wire the envelope is a flat JSON object:
//!
//! ```text
//! { "type": "goal_changed", "project_name": "demo", "user_id": "alice",
//!   "data": { "old_goal": "..", "new_goal": "..", "changed_at": ".." },
//!   "timestamp": "2024-05-01T12:00:00Z", "message_id": "9f1c.." }
//! ```

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A message encoded once and shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Discriminant of an [`Event`], also used as the type of a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ContextUpdated,
    FeatureCompleted,
    IssueResolved,
    GoalChanged,
    UserJoined,
    UserLeft,
    Heartbeat,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ContextUpdated => "context_updated",
            MessageKind::FeatureCompleted => "feature_completed",
            MessageKind::IssueResolved => "issue_resolved",
            MessageKind::GoalChanged => "goal_changed",
            MessageKind::UserJoined => "user_joined",
            MessageKind::UserLeft => "user_left",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Error => "error",
        }
    }

    /// Whether this kind describes a project mutation that belongs in the
    /// change log. Presence, heartbeat and error messages are transient.
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            MessageKind::ContextUpdated
                | MessageKind::FeatureCompleted
                | MessageKind::IssueResolved
                | MessageKind::GoalChanged
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdatedPayload {
    /// Producer-defined description of what changed.
    pub changes: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCompletedPayload {
    pub feature: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueResolvedPayload {
    pub issue: String,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalChangedPayload {
    pub old_goal: String,
    pub new_goal: String,
    pub changed_at: DateTime<Utc>,
}

/// Sent both as the welcome acknowledgment (with `message` set) and as the
/// peer notification when someone joins a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJoinedPayload {
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeftPayload {
    pub user_id: Option<String>,
    pub disconnected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// The closed set of events observers can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ContextUpdated(ContextUpdatedPayload),
    FeatureCompleted(FeatureCompletedPayload),
    IssueResolved(IssueResolvedPayload),
    GoalChanged(GoalChangedPayload),
    UserJoined(UserJoinedPayload),
    UserLeft(UserLeftPayload),
    Heartbeat(HeartbeatPayload),
    Error(ErrorPayload),
}

impl Event {
    pub fn kind(&self) -> MessageKind {
        match self {
            Event::ContextUpdated(_) => MessageKind::ContextUpdated,
            Event::FeatureCompleted(_) => MessageKind::FeatureCompleted,
            Event::IssueResolved(_) => MessageKind::IssueResolved,
            Event::GoalChanged(_) => MessageKind::GoalChanged,
            Event::UserJoined(_) => MessageKind::UserJoined,
            Event::UserLeft(_) => MessageKind::UserLeft,
            Event::Heartbeat(_) => MessageKind::Heartbeat,
            Event::Error(_) => MessageKind::Error,
        }
    }

    /// Returns the `data` object of this event as JSON.
    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Event::ContextUpdated(p) => serde_json::to_value(p),
            Event::FeatureCompleted(p) => serde_json::to_value(p),
            Event::IssueResolved(p) => serde_json::to_value(p),
            Event::GoalChanged(p) => serde_json::to_value(p),
            Event::UserJoined(p) => serde_json::to_value(p),
            Event::UserLeft(p) => serde_json::to_value(p),
            Event::Heartbeat(p) => serde_json::to_value(p),
            Event::Error(p) => serde_json::to_value(p),
        }
    }
}

/// A transient message addressed to a project scope or, when
/// `project_name` is `None`, to the global scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub event: Event,
    pub project_name: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

impl Message {
    /// Wraps an event, stamping the current time and a fresh message id.
    pub fn new(event: Event, project_name: Option<String>, user_id: Option<String>) -> Self {
        Self {
            event,
            project_name,
            user_id,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.event.kind()
    }

    /// Encodes the envelope to JSON.
    pub fn encode(&self) -> serde_json::Result<Frame> {
        serde_json::to_string(self).map(Frame::from)
    }

    pub fn context_updated(project_name: &str, user_id: Option<&str>, changes: Value) -> Self {
        Self::new(
            Event::ContextUpdated(ContextUpdatedPayload {
                changes,
                updated_at: Utc::now(),
            }),
            Some(project_name.to_string()),
            user_id.map(str::to_string),
        )
    }

    pub fn feature_completed(project_name: &str, user_id: Option<&str>, feature: &str) -> Self {
        Self::new(
            Event::FeatureCompleted(FeatureCompletedPayload {
                feature: feature.to_string(),
                completed_at: Utc::now(),
            }),
            Some(project_name.to_string()),
            user_id.map(str::to_string),
        )
    }

    pub fn issue_resolved(project_name: &str, user_id: Option<&str>, issue: &str) -> Self {
        Self::new(
            Event::IssueResolved(IssueResolvedPayload {
                issue: issue.to_string(),
                resolved_at: Utc::now(),
            }),
            Some(project_name.to_string()),
            user_id.map(str::to_string),
        )
    }

    pub fn goal_changed(
        project_name: &str,
        user_id: Option<&str>,
        old_goal: &str,
        new_goal: &str,
    ) -> Self {
        Self::new(
            Event::GoalChanged(GoalChangedPayload {
                old_goal: old_goal.to_string(),
                new_goal: new_goal.to_string(),
                changed_at: Utc::now(),
            }),
            Some(project_name.to_string()),
            user_id.map(str::to_string),
        )
    }

    /// The acknowledgment sent to a connection right after it registers.
    pub fn welcome(
        project_name: Option<&str>,
        user_id: Option<&str>,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            Event::UserJoined(UserJoinedPayload {
                user_id: user_id.map(str::to_string),
                message: Some("Connected to real-time updates".to_string()),
                project_name: project_name.map(str::to_string),
                connected_at,
            }),
            project_name.map(str::to_string),
            user_id.map(str::to_string),
        )
    }

    /// Peer notification that `user_id` joined `project_name`.
    pub fn user_joined(
        project_name: &str,
        user_id: Option<&str>,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            Event::UserJoined(UserJoinedPayload {
                user_id: user_id.map(str::to_string),
                message: None,
                project_name: None,
                connected_at,
            }),
            Some(project_name.to_string()),
            user_id.map(str::to_string),
        )
    }

    pub fn user_left(project_name: &str, user_id: Option<&str>) -> Self {
        Self::new(
            Event::UserLeft(UserLeftPayload {
                user_id: user_id.map(str::to_string),
                disconnected_at: Utc::now(),
            }),
            Some(project_name.to_string()),
            user_id.map(str::to_string),
        )
    }

    pub fn heartbeat(project_name: Option<&str>) -> Self {
        Self::new(
            Event::Heartbeat(HeartbeatPayload {
                sent_at: Utc::now(),
            }),
            project_name.map(str::to_string),
            None,
        )
    }

    pub fn error(project_name: Option<&str>, message: impl fmt::Display) -> Self {
        Self::new(
            Event::Error(ErrorPayload {
                message: message.to_string(),
            }),
            project_name.map(str::to_string),
            None,
        )
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Message", 6)?;
        state.serialize_field("type", &self.kind())?;
        state.serialize_field("project_name", &self.project_name)?;
        state.serialize_field("user_id", &self.user_id)?;
        match &self.event {
            Event::ContextUpdated(p) => state.serialize_field("data", p)?,
            Event::FeatureCompleted(p) => state.serialize_field("data", p)?,
            Event::IssueResolved(p) => state.serialize_field("data", p)?,
            Event::GoalChanged(p) => state.serialize_field("data", p)?,
            Event::UserJoined(p) => state.serialize_field("data", p)?,
            Event::UserLeft(p) => state.serialize_field("data", p)?,
            Event::Heartbeat(p) => state.serialize_field("data", p)?,
            Event::Error(p) => state.serialize_field("data", p)?,
        }
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("message_id", &self.message_id)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let msg = Message::goal_changed("demo", Some("alice"), "ship v1", "ship v2");
        let json: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        let obj = json.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["data", "message_id", "project_name", "timestamp", "type", "user_id"]
        );

        assert_eq!(json["type"], "goal_changed");
        assert_eq!(json["project_name"], "demo");
        assert_eq!(json["user_id"], "alice");
        assert_eq!(json["data"]["old_goal"], "ship v1");
        assert_eq!(json["data"]["new_goal"], "ship v2");
        assert!(json["data"]["changed_at"].is_string());
    }

    #[test]
    fn test_only_mutations_are_changes() {
        assert!(MessageKind::GoalChanged.is_change());
        assert!(MessageKind::ContextUpdated.is_change());
        assert!(!MessageKind::UserJoined.is_change());
        assert!(!MessageKind::UserLeft.is_change());
        assert!(!MessageKind::Heartbeat.is_change());
        assert!(!MessageKind::Error.is_change());
    }

    #[test]
    fn test_global_message_has_null_project() {
        let msg = Message::heartbeat(None);
        let json: Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "heartbeat");
        assert!(json["project_name"].is_null());
        assert!(json["user_id"].is_null());
        assert!(json["data"].is_object());
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::feature_completed("demo", None, "login");
        let b = Message::feature_completed("demo", None, "login");
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_timestamp_is_iso8601() {
        let msg = Message::issue_resolved("demo", None, "flaky build");
        let json: Value = serde_json::to_value(&msg).unwrap();
        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_kind_matches_payload() {
        let msg = Message::context_updated(
            "demo",
            Some("bob"),
            serde_json::json!({ "action": "issue_added" }),
        );
        assert_eq!(msg.kind(), MessageKind::ContextUpdated);

        let payload = msg.event.payload().unwrap();
        assert_eq!(payload["changes"]["action"], "issue_added");
    }

    #[test]
    fn test_welcome_vs_peer_join() {
        let now = Utc::now();
        let welcome = serde_json::to_value(Message::welcome(Some("demo"), Some("a"), now)).unwrap();
        let joined = serde_json::to_value(Message::user_joined("demo", Some("a"), now)).unwrap();

        assert_eq!(welcome["type"], "user_joined");
        assert_eq!(welcome["data"]["message"], "Connected to real-time updates");
        assert_eq!(joined["type"], "user_joined");
        assert!(joined["data"].get("message").is_none());
        assert_eq!(joined["data"]["user_id"], "a");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MessageKind::UserLeft.to_string(), "user_left");
        assert_eq!(
            serde_json::to_value(MessageKind::IssueResolved).unwrap(),
            "issue_resolved"
        );
    }
}
