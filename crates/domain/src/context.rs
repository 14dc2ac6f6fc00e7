//! Context sessions and conversation turns.
//!
//! A context session is a conversational or agent workspace with its own
//! active-message lock, FIFO queue and history. The lock invariant: at
//! most one non-null `active_message_id` per session, enforced by
//! compare-and-swap on the session record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Conversation,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
}

/// A message waiting for the session lock to free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message: String,
    pub source_id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// A conversation or agent workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSession {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// The lock holder. `None` = idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_message_id: Option<String>,
    #[serde(default)]
    pub cancellation_requested: bool,
    /// Pending messages, FIFO by arrival.
    #[serde(default)]
    pub queue: Vec<QueuedMessage>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextSession {
    pub fn is_idle(&self) -> bool {
        self.active_message_id.is_none()
    }

    /// Closed sessions accept reads only.
    pub fn is_writable(&self) -> bool {
        self.status == SessionStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
    Tool,
}

/// One history entry.
///
/// `correlation_id` ties model/tool turns back to the user turn that
/// started them; for user turns it equals the message id itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Turn {
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            correlation_id: id.clone(),
            id,
            role: TurnRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn model(correlation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: TurnRole::Model,
            content: content.into(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            metadata: None,
        }
    }

    pub fn tool(correlation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: TurnRole::Tool,
            content: content.into(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// History grouped by `correlation_id`: one user turn plus the model and
/// tool turns it produced, in append order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnGroup {
    pub correlation_id: String,
    pub turns: Vec<Turn>,
}

/// Group a flat history by correlation id, preserving first-seen order.
pub fn group_turns(history: &[Turn]) -> Vec<TurnGroup> {
    let mut groups: Vec<TurnGroup> = Vec::new();
    for turn in history {
        match groups.iter_mut().find(|g| g.correlation_id == turn.correlation_id) {
            Some(group) => group.turns.push(turn.clone()),
            None => groups.push(TurnGroup {
                correlation_id: turn.correlation_id.clone(),
                turns: vec![turn.clone()],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_turn_correlates_to_itself() {
        let turn = Turn::user("m1", "hello");
        assert_eq!(turn.correlation_id, "m1");
        assert_eq!(turn.role, TurnRole::User);
    }

    #[test]
    fn grouping_preserves_first_seen_order() {
        let history = vec![
            Turn::user("m1", "first"),
            Turn::model("m1", "reply one"),
            Turn::user("m2", "second"),
            Turn::tool("m2", "tool output"),
            Turn::model("m2", "reply two"),
        ];
        let groups = group_turns(&history);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].correlation_id, "m1");
        assert_eq!(groups[0].turns.len(), 2);
        assert_eq!(groups[1].correlation_id, "m2");
        assert_eq!(groups[1].turns.len(), 3);
    }

    #[test]
    fn closed_session_is_not_writable() {
        let session = ContextSession {
            id: "s1".into(),
            session_type: SessionType::Conversation,
            status: SessionStatus::Closed,
            user_id: None,
            active_message_id: None,
            cancellation_requested: false,
            queue: vec![],
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!session.is_writable());
        assert!(session.is_idle());
    }
}
