//! Scheduled agents and their execution logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A prompt run on a cron schedule inside its own agent-type session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub prompt: String,
    /// 5-field cron expression, evaluated in UTC.
    pub schedule: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// One recorded agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionLog {
    pub id: String,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub trace_count: usize,
    #[serde(default)]
    pub response_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Traces captured during the run, attached only when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traces: Option<Vec<crate::trace::Trace>>,
}
