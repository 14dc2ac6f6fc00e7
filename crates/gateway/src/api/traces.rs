//! Trace endpoints.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::Extension;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use sz_domain::auth::AuthContext;
use sz_domain::trace::Trace;

use crate::api::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TraceQuery {
    pub since: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn list(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Query(query): Query<TraceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let traces = state.traces.list(query.since, query.limit).await?;
    Ok(Json(serde_json::json!({ "traces": traces })))
}

pub async fn get_trace(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Trace>> {
    Ok(Json(state.traces.get(&id).await?))
}

/// Direct trace ingestion (clients logging outside a chat turn).
pub async fn record(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Json(trace): Json<Trace>,
) -> ApiResult<Json<Trace>> {
    Ok(Json(state.traces.record(trace).await?))
}
