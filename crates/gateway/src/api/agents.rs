//! Agent endpoints.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;

use sz_domain::agent::Agent;
use sz_domain::auth::AuthContext;
use sz_domain::Error;

use crate::api::{ApiError, ApiResult};
use crate::runtime::agents::execute_agent;
use crate::state::AppState;

fn visible(agent: &Agent, auth: &AuthContext) -> bool {
    auth.is_admin()
        || agent.owner_user_id.is_none()
        || agent.owner_user_id.as_deref() == auth.user_id.as_deref()
}

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<Agent>>> {
    let agents = state
        .agents
        .list()
        .await?
        .into_iter()
        .filter(|a| visible(a, &auth))
        .collect();
    Ok(Json(agents))
}

#[derive(Deserialize)]
pub struct UpsertAgentBody {
    pub id: Option<String>,
    pub prompt: String,
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn upsert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<UpsertAgentBody>,
) -> ApiResult<Json<Agent>> {
    let id = body
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let agent = state
        .agents
        .upsert_agent(&id, &body.prompt, &body.schedule, body.enabled, &auth)
        .await?;
    Ok(Json(agent))
}

pub async fn upsert_by_id(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpsertAgentBody>,
) -> ApiResult<Json<Agent>> {
    let agent = state
        .agents
        .upsert_agent(&id, &body.prompt, &body.schedule, body.enabled, &auth)
        .await?;
    Ok(Json(agent))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    let agent = state.agents.get(&id).await?;
    if !visible(&agent, &auth) {
        return Err(ApiError(Error::NotFound(format!("agent {id}"))));
    }
    Ok(Json(agent))
}

pub async fn delete_agent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.agents.delete_agent(&id, &auth).await?;
    Ok(Json(serde_json::json!({ "status": "deleted", "id": id })))
}

#[derive(Deserialize, Default)]
pub struct TriggerBody {
    pub message: Option<String>,
}

/// Run the agent now. The execution is awaited so the caller gets the
/// completed log entry back.
pub async fn trigger(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    body: Option<Json<TriggerBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = state.agents.get(&id).await?;
    if !visible(&agent, &auth) {
        return Err(ApiError(Error::NotFound(format!("agent {id}"))));
    }
    let message = body.and_then(|Json(b)| b.message);
    let log = execute_agent(&state, &id, message).await?;
    Ok(Json(serde_json::json!({ "execution": log })))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
    #[serde(default, rename = "includeTraces")]
    pub include_traces: bool,
}

fn default_log_limit() -> usize {
    50
}

pub async fn logs(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let logs = state
        .agents
        .get_execution_logs(
            query.agent_id.as_deref(),
            query.limit,
            query.include_traces,
            &state.traces,
        )
        .await?;
    Ok(Json(serde_json::json!({ "executions": logs })))
}
