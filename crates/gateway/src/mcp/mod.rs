//! The MCP control surface: an API-key-gated SSE stream plus a
//! session-scoped JSON-RPC endpoint exposing a filtered tool set.
//!
//! `GET /mcp/sse` allocates a short-TTL session and emits an `endpoint`
//! event pointing at `POST /mcp/messages?sessionId=…`. Disconnecting
//! frees the session; a stale session id answers 404.

pub mod protocol;

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sz_domain::auth::{AuthContext, Role};
use sz_domain::trace::Trace;
use sz_domain::Error;
use sz_registry::SearchOptions;

use crate::prompts;
use crate::runtime::tools::{mcp_denial, mcp_tool_definitions, ToolExecutor};
use crate::state::AppState;

use protocol::{
    JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND,
    PROTOCOL_VERSION,
};

fn session_key(id: &str) -> String {
    format!("mcp:session:{id}")
}

/// What a live SSE connection persists.
#[derive(Debug, Serialize, Deserialize)]
struct McpSession {
    user_id: Option<String>,
    role: Role,
    created_at: chrono::DateTime<Utc>,
}

impl McpSession {
    fn auth_context(&self) -> AuthContext {
        AuthContext {
            user_id: self.user_id.clone(),
            username: None,
            role: self.role,
        }
    }
}

/// Deletes the session key when the SSE stream is dropped.
struct SessionCleanup {
    state: AppState,
    session_id: String,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        let state = self.state.clone();
        let key = session_key(&self.session_id);
        tokio::spawn(async move {
            let _ = state.kv.del(&key).await;
            tracing::debug!(key = %key, "mcp session cleaned up");
        });
    }
}

async fn api_key_auth(state: &AppState, headers: &HeaderMap) -> Option<AuthContext> {
    let key = headers.get("x-api-key")?.to_str().ok()?;
    state.users.resolve_api_key(key).await.ok().flatten()
}

// ── GET /mcp/sse ───────────────────────────────────────────────────

pub async fn sse_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(auth) = api_key_auth(&state, &headers).await else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing x-api-key" })),
        )
            .into_response();
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let record = McpSession {
        user_id: auth.user_id.clone(),
        role: auth.role,
        created_at: Utc::now(),
    };
    let ttl = Duration::from_secs(state.config.mcp.session_ttl_secs);
    let raw = match serde_json::to_string(&record) {
        Ok(raw) => raw,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };
    if let Err(e) = state.kv.set_with_ttl(&session_key(&session_id), &raw, ttl).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response();
    }
    tracing::info!(session_id = %session_id, "mcp session opened");

    // Absolute endpoint URL, built from the Host header when present.
    let endpoint = match headers.get("host").and_then(|v| v.to_str().ok()) {
        Some(host) => format!("http://{host}/mcp/messages?sessionId={session_id}"),
        None => format!("/mcp/messages?sessionId={session_id}"),
    };

    let keep_alive_secs = state.config.mcp.keep_alive_secs;
    let cleanup = SessionCleanup {
        state,
        session_id,
    };
    let stream = async_stream::stream! {
        // Held for the stream's lifetime; dropping it frees the session.
        let _cleanup = cleanup;
        yield Ok::<_, std::convert::Infallible>(
            Event::default().event("endpoint").data(endpoint),
        );
        loop {
            tokio::time::sleep(Duration::from_secs(keep_alive_secs)).await;
            yield Ok(Event::default().comment("keep-alive"));
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(keep_alive_secs)))
        .into_response()
}

// ── POST /mcp/messages ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

pub async fn messages_handler(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    Json(body): Json<Value>,
) -> Response {
    // The SSE stream owns the session's lifetime.
    let session: McpSession = match state.kv.get(&session_key(&query.session_id)).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
        },
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Session not found" })),
            )
                .into_response()
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    let request: JsonRpcRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(_) => {
            return Json(JsonRpcResponse::err(
                Value::Null,
                INVALID_REQUEST,
                "request is not a JSON-RPC 2.0 envelope",
            ))
            .into_response()
        }
    };
    if !request.is_valid_envelope() {
        let id = request.id.unwrap_or(Value::Null);
        return Json(JsonRpcResponse::err(
            id,
            INVALID_REQUEST,
            "jsonrpc must be \"2.0\" with a method",
        ))
        .into_response();
    }
    if request.is_notification() {
        // Fire-and-forget: acknowledged with no body.
        return StatusCode::ACCEPTED.into_response();
    }

    let id = request.id.clone().unwrap_or(Value::Null);
    let params = request.params.clone().unwrap_or(Value::Null);
    let auth = session.auth_context();

    let response = match dispatch(&state, &request.method, &params, &auth).await {
        Ok(result) => JsonRpcResponse::ok(id, result),
        Err((code, message)) => JsonRpcResponse::err(id, code, message),
    };
    Json(response).into_response()
}

// ── Method dispatch ────────────────────────────────────────────────

async fn dispatch(
    state: &AppState,
    method: &str,
    params: &Value,
    auth: &AuthContext,
) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {}, "prompts": {} },
            "serverInfo": {
                "name": "signalzero",
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
        "ping" => Ok(json!({})),

        "prompts/list" => Ok(json!({
            "prompts": [{
                "name": "signalzero",
                "description": "The SignalZero control-channel prompt",
            }]
        })),
        "prompts/get" => {
            let text = state.prompts.mcp_prompt();
            let text = if text.is_empty() {
                prompts::DEFAULT_MCP_PROMPT.to_owned()
            } else {
                text
            };
            Ok(json!({
                "description": "The SignalZero control-channel prompt",
                "messages": [{
                    "role": "user",
                    "content": { "type": "text", "text": text }
                }]
            }))
        }

        "tools/list" => {
            let tools: Vec<Value> = mcp_tool_definitions(auth.is_admin())
                .into_iter()
                .map(|def| {
                    json!({
                        "name": def.name,
                        "description": def.description,
                        "inputSchema": def.parameters,
                    })
                })
                .collect();
            Ok(json!({ "tools": tools }))
        }
        "tools/call" => {
            let name = params["name"]
                .as_str()
                .ok_or((INVALID_REQUEST, "tools/call requires name".to_owned()))?;
            if let Some(denial) = mcp_denial(name, auth.is_admin()) {
                return Err((INTERNAL_ERROR, denial));
            }
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or(Value::Object(Default::default()));
            let executor = ToolExecutor::new(state.clone(), None, true, auth.clone());
            let (result, is_error) = executor.execute(name, &arguments).await;
            Ok(json!({
                "content": [{ "type": "text", "text": result }],
                "isError": is_error,
            }))
        }

        // ── Direct registry helpers ───────────────────────────────
        "domains/list" => {
            let summaries = state
                .registry
                .get_metadata(auth)
                .await
                .map_err(internal)?;
            serde_json::to_value(summaries).map_err(|e| internal(Error::Json(e)))
        }
        "domains/get" => {
            let id = params["id"]
                .as_str()
                .ok_or((INVALID_REQUEST, "domains/get requires id".to_owned()))?;
            let domain = state
                .registry
                .get_visible_domain(id, auth)
                .await
                .map_err(internal)?;
            serde_json::to_value(domain).map_err(|e| internal(Error::Json(e)))
        }
        "symbols/search" => {
            let query = params["query"]
                .as_str()
                .ok_or((INVALID_REQUEST, "symbols/search requires query".to_owned()))?;
            let hits = state
                .registry
                .search(
                    Some(query),
                    auth,
                    SearchOptions {
                        limit: params["limit"].as_u64().unwrap_or(10) as usize,
                        ..Default::default()
                    },
                )
                .await
                .map_err(internal)?;
            serde_json::to_value(hits).map_err(|e| internal(Error::Json(e)))
        }
        "symbols/activate" => {
            let id = params["id"]
                .as_str()
                .ok_or((INVALID_REQUEST, "symbols/activate requires id".to_owned()))?;
            let symbol = state
                .registry
                .find_by_id(id, auth)
                .await
                .map_err(internal)?;
            let trace = Trace {
                id: String::new(),
                session_id: None,
                entry_node: symbol.id.clone(),
                activated_by: "mcp".into(),
                activation_path: vec![],
                source_context: sz_domain::trace::SourceContext {
                    symbol_domain: symbol.symbol_domain.clone(),
                    trigger_vector: String::new(),
                },
                output_node: symbol.id.clone(),
                status: "activated".into(),
                created_at: String::new(),
            };
            state.traces.record(trace).await.map_err(internal)?;
            serde_json::to_value(symbol).map_err(|e| internal(Error::Json(e)))
        }
        "context/build" => {
            let query = params["query"]
                .as_str()
                .ok_or((INVALID_REQUEST, "context/build requires query".to_owned()))?;
            let hits = state
                .registry
                .search(
                    Some(query),
                    auth,
                    SearchOptions {
                        limit: params["limit"].as_u64().unwrap_or(5) as usize,
                        ..Default::default()
                    },
                )
                .await
                .map_err(internal)?;
            let mut context = String::new();
            for hit in &hits {
                context.push_str(&format!(
                    "[{}] {} — {}\n",
                    hit.symbol.id, hit.symbol.name, hit.symbol.role
                ));
            }
            Ok(json!({
                "prompt": state.prompts.system_prompt(),
                "context": context,
                "symbols": hits.len(),
            }))
        }

        _ => Err((METHOD_NOT_FOUND, format!("method {method} not found"))),
    }
}

fn internal(err: Error) -> (i64, String) {
    (INTERNAL_ERROR, err.to_string())
}
