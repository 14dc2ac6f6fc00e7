//! The agent scheduler: durable agent definitions, cron evaluation,
//! at-most-one run per agent, and the execution log.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use sz_domain::agent::{Agent, AgentExecutionLog, ExecutionStatus};
use sz_domain::auth::AuthContext;
use sz_domain::context::TurnRole;
use sz_domain::{Error, Result};
use sz_store::KvStore;

use crate::runtime::cron;
use crate::runtime::traces::TraceStore;
use crate::runtime::turn::{self, TurnRequest};
use crate::state::AppState;

const AGENTS_SET: &str = "sz:agents";
const EXECUTIONS_ZSET: &str = "sz:agents:executions";
/// Execution logs kept after each trim.
const EXECUTION_LOG_KEEP: usize = 500;

fn agent_key(id: &str) -> String {
    format!("sz:agent:{id}")
}

fn execution_key(id: &str) -> String {
    format!("sz:agents:execution:{id}")
}

/// Each agent runs in one fixed agent-type context session.
pub fn agent_session_id(agent_id: &str) -> String {
    format!("agent-{agent_id}")
}

pub struct AgentService {
    kv: Arc<dyn KvStore>,
    /// Agents with an execution in flight. A due tick for a running
    /// agent is dropped, never queued.
    running: Mutex<HashSet<String>>,
    /// Last minute bucket the scheduler evaluated.
    last_minute: Mutex<Option<i64>>,
}

impl AgentService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            running: Mutex::new(HashSet::new()),
            last_minute: Mutex::new(None),
        }
    }

    // ── Definitions ───────────────────────────────────────────────

    pub async fn upsert_agent(
        &self,
        id: &str,
        prompt: &str,
        schedule: &str,
        enabled: bool,
        auth: &AuthContext,
    ) -> Result<Agent> {
        if id.trim().is_empty() || prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("agent id and prompt are required".into()));
        }
        if !cron::validate_cron(schedule) {
            return Err(Error::InvalidRequest(format!(
                "malformed cron expression: {schedule}"
            )));
        }
        let existing = self.load(id).await.ok();
        if let Some(existing) = &existing {
            self.assert_manageable(existing, auth)?;
        }
        let now = Utc::now();
        let agent = Agent {
            id: id.to_owned(),
            prompt: prompt.to_owned(),
            schedule: schedule.to_owned(),
            enabled,
            owner_user_id: existing
                .as_ref()
                .and_then(|e| e.owner_user_id.clone())
                .or_else(|| {
                    if auth.is_admin() {
                        None
                    } else {
                        auth.user_id.clone()
                    }
                }),
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
            last_run_at: existing.as_ref().and_then(|e| e.last_run_at),
            last_status: existing.as_ref().and_then(|e| e.last_status),
        };
        self.save(&agent).await?;
        self.kv.sadd(AGENTS_SET, id).await?;
        tracing::info!(agent_id = %id, schedule = %schedule, enabled, "agent upserted");
        Ok(agent)
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        let mut ids = self.kv.smembers(AGENTS_SET).await?;
        ids.sort();
        let mut agents = Vec::new();
        for id in ids {
            if let Ok(agent) = self.load(&id).await {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    pub async fn get(&self, id: &str) -> Result<Agent> {
        self.load(id).await
    }

    pub async fn delete_agent(&self, id: &str, auth: &AuthContext) -> Result<()> {
        let agent = self.load(id).await?;
        self.assert_manageable(&agent, auth)?;
        self.kv.del(&agent_key(id)).await?;
        self.kv.srem(AGENTS_SET, id).await?;
        Ok(())
    }

    /// Swap the whole agent table (project import).
    pub async fn replace_all_agents(&self, agents: Vec<Agent>) -> Result<()> {
        for id in self.kv.smembers(AGENTS_SET).await? {
            self.kv.del(&agent_key(&id)).await?;
            self.kv.srem(AGENTS_SET, &id).await?;
        }
        for agent in agents {
            self.save(&agent).await?;
            self.kv.sadd(AGENTS_SET, &agent.id).await?;
        }
        Ok(())
    }

    fn assert_manageable(&self, agent: &Agent, auth: &AuthContext) -> Result<()> {
        if auth.is_admin() || agent.owner_user_id.as_deref() == auth.user_id.as_deref() {
            Ok(())
        } else {
            Err(Error::NotFound(format!("agent {}", agent.id)))
        }
    }

    // ── Execution log ─────────────────────────────────────────────

    pub async fn record_execution(&self, log: &AgentExecutionLog) -> Result<()> {
        let raw = serde_json::to_string(log)?;
        self.kv.set(&execution_key(&log.id), &raw).await?;
        self.kv
            .zadd(
                EXECUTIONS_ZSET,
                log.started_at.timestamp_millis() as f64,
                &log.id,
            )
            .await?;
        // Bounded history: trim the sorted set and drop the records.
        for removed in self
            .kv
            .ztrim_keep_recent(EXECUTIONS_ZSET, EXECUTION_LOG_KEEP)
            .await?
        {
            self.kv.del(&execution_key(&removed)).await?;
        }
        Ok(())
    }

    pub async fn get_execution_logs(
        &self,
        agent_id: Option<&str>,
        limit: usize,
        include_traces: bool,
        traces: &TraceStore,
    ) -> Result<Vec<AgentExecutionLog>> {
        let ids = self.kv.zrevrange(EXECUTIONS_ZSET, 500).await?;
        let mut logs = Vec::new();
        for id in ids {
            let Some(raw) = self.kv.get(&execution_key(&id)).await? else {
                continue;
            };
            let mut log: AgentExecutionLog = serde_json::from_str(&raw)?;
            if let Some(agent_id) = agent_id {
                if log.agent_id != agent_id {
                    continue;
                }
            }
            if include_traces {
                let session = agent_session_id(&log.agent_id);
                let mut attached = traces
                    .for_session(&session, Some(log.started_at))
                    .await?;
                if let Some(finished) = log.finished_at {
                    attached.retain(|t| {
                        sz_domain::stamp::decode(&t.created_at)
                            .map(|ts| ts <= finished)
                            .unwrap_or(true)
                    });
                }
                log.traces = Some(attached);
            }
            logs.push(log);
            if logs.len() == limit.max(1) {
                break;
            }
        }
        Ok(logs)
    }

    // ── Scheduling ────────────────────────────────────────────────

    /// Called every tick (≤ 1 s). Fires each enabled agent whose cron
    /// matches the minute the wall clock just entered.
    pub async fn tick(&self, state: &AppState) {
        let minute = Utc::now().timestamp() / 60;
        {
            let mut last = self.last_minute.lock();
            if *last == Some(minute) {
                return;
            }
            *last = Some(minute);
        }
        let Some(minute_start) = Utc.timestamp_opt(minute * 60, 0).single() else {
            return;
        };

        let agents = match self.list().await {
            Ok(agents) => agents,
            Err(e) => {
                tracing::warn!(error = %e, "scheduler could not list agents");
                return;
            }
        };
        for agent in agents {
            if !agent.enabled || !cron::cron_matches(&agent.schedule, &minute_start) {
                continue;
            }
            if self.running.lock().contains(&agent.id) {
                tracing::info!(agent_id = %agent.id, "agent still running, dropping due tick");
                continue;
            }
            let state = state.clone();
            let agent_id = agent.id.clone();
            tokio::spawn(async move {
                if let Err(e) = execute_agent(&state, &agent_id, None).await {
                    tracing::warn!(agent_id = %agent_id, error = %e, "scheduled agent run failed");
                }
            });
        }
    }

    pub(crate) fn try_begin(&self, agent_id: &str) -> bool {
        self.running.lock().insert(agent_id.to_owned())
    }

    pub(crate) fn finish(&self, agent_id: &str) {
        self.running.lock().remove(agent_id);
    }

    // ── Internals ─────────────────────────────────────────────────

    async fn load(&self, id: &str) -> Result<Agent> {
        let raw = self
            .kv
            .get(&agent_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent {id}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    async fn save(&self, agent: &Agent) -> Result<()> {
        let raw = serde_json::to_string(agent)?;
        self.kv.set(&agent_key(&agent.id), &raw).await
    }
}

/// Run one agent execution end to end: session, lock, turn, log entry.
pub async fn execute_agent(
    state: &AppState,
    id: &str,
    message_override: Option<String>,
) -> Result<AgentExecutionLog> {
    let agent = state.agents.get(id).await?;
    if !state.agents.try_begin(id) {
        return Err(Error::Busy(format!("agent {id} is already running")));
    }
    let result = execute_agent_inner(state, &agent, message_override).await;
    state.agents.finish(id);
    result
}

async fn execute_agent_inner(
    state: &AppState,
    agent: &Agent,
    message_override: Option<String>,
) -> Result<AgentExecutionLog> {
    let internal = AuthContext::internal();
    let session_id = agent_session_id(&agent.id);
    state.contexts.ensure_agent_session(&session_id).await?;

    let started_at = Utc::now();
    let message_id = format!("agent-{}", started_at.timestamp_millis());
    state
        .contexts
        .set_active_message(&session_id, &message_id, &internal)
        .await?;

    let mut log = AgentExecutionLog {
        id: uuid::Uuid::new_v4().to_string(),
        agent_id: agent.id.clone(),
        started_at,
        finished_at: None,
        status: ExecutionStatus::Running,
        trace_count: 0,
        response_preview: String::new(),
        error: None,
        traces: None,
    };
    state.agents.record_execution(&log).await?;

    // The turn clears the lock and drains the queue itself.
    turn::process_message(
        state.clone(),
        TurnRequest {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
            message: message_override.unwrap_or_else(|| agent.prompt.clone()),
            auth: internal.clone(),
            record_user: true,
        },
    )
    .await;

    // Read the outcome back from history.
    let history = state.contexts.get_history(&session_id, &internal).await?;
    let final_turn = history
        .iter()
        .rev()
        .find(|t| t.role == TurnRole::Model && t.correlation_id == message_id);

    let finished_at = Utc::now();
    let (status, preview, error) = match final_turn {
        Some(turn) => {
            let failed = turn
                .metadata
                .as_ref()
                .and_then(|m| m.get("error"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if failed {
                (
                    ExecutionStatus::Failed,
                    truncate(&turn.content, 200),
                    Some(turn.content.clone()),
                )
            } else {
                (ExecutionStatus::Completed, truncate(&turn.content, 200), None)
            }
        }
        None => (
            ExecutionStatus::Failed,
            String::new(),
            Some("no model turn recorded".into()),
        ),
    };

    log.finished_at = Some(finished_at);
    log.status = status;
    log.response_preview = preview;
    log.error = error;
    log.trace_count = state
        .traces
        .for_session(&session_id, Some(started_at))
        .await?
        .len();
    state.agents.record_execution(&log).await?;

    // Update last-run metadata on the agent record.
    let mut updated = agent.clone();
    updated.last_run_at = Some(started_at);
    updated.last_status = Some(status);
    updated.updated_at = finished_at;
    state
        .agents
        .save_for_update(&updated)
        .await
        .unwrap_or_else(|e| tracing::warn!(error = %e, "failed to update agent last-run metadata"));

    tracing::info!(agent_id = %agent.id, status = ?status, "agent execution finished");
    Ok(log)
}

impl AgentService {
    pub(crate) async fn save_for_update(&self, agent: &Agent) -> Result<()> {
        self.save(agent).await
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_owned()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}
