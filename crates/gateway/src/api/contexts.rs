//! Context session endpoints: create/list, archive, grouped history and
//! the queueing trigger.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::Extension;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use sz_domain::auth::AuthContext;
use sz_domain::context::{ContextSession, SessionType, TurnGroup};

use crate::api::ApiResult;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<ContextSession>>> {
    Ok(Json(state.contexts.list_sessions(&auth).await?))
}

#[derive(Deserialize)]
pub struct CreateContextBody {
    #[serde(default = "default_type", rename = "type")]
    pub session_type: SessionType,
    #[serde(default)]
    pub metadata: Value,
}

fn default_type() -> SessionType {
    SessionType::Conversation
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateContextBody>,
) -> ApiResult<Json<ContextSession>> {
    let session = state
        .contexts
        .create_session(body.session_type, body.metadata, auth.user_id.clone())
        .await?;
    Ok(Json(session))
}

pub async fn archive(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContextSession>> {
    Ok(Json(state.contexts.close_session(&id, &auth).await?))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
}

pub async fn history(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<TurnGroup>>> {
    let groups = state
        .contexts
        .get_history_grouped(&id, query.since, &auth)
        .await?;
    Ok(Json(groups))
}

#[derive(Deserialize)]
pub struct TriggerBody {
    pub message: String,
    #[serde(default)]
    pub source_id: Option<String>,
}

/// Queue a message for the session. If the session is idle the queue is
/// drained immediately; if a turn is in flight the message waits its
/// turn in FIFO order.
pub async fn trigger(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let source = body.source_id.unwrap_or_else(|| "trigger".into());
    let depth = state
        .contexts
        .enqueue_message(&id, &body.message, &source, &auth)
        .await?;
    state.kick_queue(id.clone());
    Ok(Json(serde_json::json!({
        "status": "queued",
        "contextSessionId": id,
        "queueDepth": depth,
    })))
}
