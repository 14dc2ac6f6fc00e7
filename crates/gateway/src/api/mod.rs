pub mod agents;
pub mod auth;
pub mod chat;
pub mod contexts;
pub mod domains;
pub mod health;
pub mod project;
pub mod symbols;
pub mod traces;
pub mod users;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post};
use axum::Router;

use sz_domain::Error;

use crate::state::AppState;

/// Wrapper so handlers can use `?` on domain errors and get the HTTP
/// mapping from §7 of the error design.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self(Error::Json(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            Error::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "unauthorized" }),
            ),
            Error::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, serde_json::json!({ "error": msg }))
            }
            Error::NotFound(msg) => {
                (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg }))
            }
            Error::Conflict(msg) => {
                (StatusCode::CONFLICT, serde_json::json!({ "error": msg }))
            }
            Error::Busy(id) => (
                StatusCode::CONFLICT,
                serde_json::json!({
                    "status": "context busy",
                    "contextSessionId": id,
                }),
            ),
            Error::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
            }
            Error::InvalidSymbol { reason, field } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": reason, "field": field }),
            ),
            Error::ReadOnlyDomain {
                domain_id,
                symbol_id,
            } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": format!("domain {domain_id} is read-only"),
                    "domainId": domain_id,
                    "symbolId": symbol_id,
                }),
            ),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": other.to_string() }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Build the full API router.
///
/// Routes are split into **public** (health, auth bootstrap, the MCP
/// channel with its own key gating) and **protected** (everything else,
/// behind the credential-resolving middleware).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/auth/status", get(auth::status))
        .route("/api/auth/setup", post(auth::setup))
        .route("/api/auth/login", post(auth::login))
        // MCP channel: gated by x-api-key inside the handlers.
        .route("/mcp/sse", get(crate::mcp::sse_handler))
        .route("/mcp/messages", post(crate::mcp::messages_handler));

    let protected = Router::new()
        // Auth
        .route("/api/auth/change-password", post(auth::change_password))
        // Users (admin except /me)
        .route("/api/users", get(users::list).post(users::create))
        .route("/api/users/me", get(users::me))
        .route(
            "/api/users/:id",
            get(users::get_user).patch(users::update).delete(users::delete_user),
        )
        .route("/api/users/:id/apikey", post(users::mint_api_key))
        // Contexts
        .route("/api/contexts", get(contexts::list).post(contexts::create))
        .route("/api/contexts/:id/archive", post(contexts::archive))
        .route("/api/contexts/:id/history", get(contexts::history))
        .route("/api/contexts/:id/trigger", post(contexts::trigger))
        // Chat
        .route("/api/chat", post(chat::chat))
        .route("/api/chat/stop", post(chat::stop))
        // Domains
        .route("/api/domains", get(domains::list).post(domains::create))
        .route(
            "/api/domains/:id",
            patch(domains::update).delete(domains::delete),
        )
        .route("/api/domains/:id/exists", get(domains::exists))
        .route("/api/domains/:id/enabled", get(domains::enabled))
        .route("/api/domains/:id/toggle", post(domains::toggle))
        .route(
            "/api/domains/:id/symbols",
            get(symbols::list_in_domain).post(symbols::upsert),
        )
        .route("/api/domains/:id/symbols/bulk", post(symbols::bulk_upsert))
        .route("/api/domains/:id/symbols/rename", post(symbols::rename))
        .route(
            "/api/domains/:id/symbols/:symbol_id",
            delete(symbols::delete_symbol),
        )
        .route("/api/domains/:id/query", get(symbols::query))
        // Symbols
        .route("/api/symbols/search", get(symbols::search))
        .route("/api/symbols/refactor", post(symbols::refactor))
        .route("/api/symbols/compress", post(symbols::compress))
        .route("/api/symbols/:id", get(symbols::get_symbol))
        // Vector index maintenance (admin)
        .route("/api/index/reindex", post(symbols::reindex))
        .route("/api/index/status", get(symbols::index_status))
        // Tests
        .route("/api/tests/sets", get(tests::list_sets).post(tests::create_set))
        .route(
            "/api/tests/sets/:id",
            get(tests::get_set).delete(tests::delete_set),
        )
        .route("/api/tests/runs", get(tests::list_runs).post(tests::start_run))
        .route("/api/tests/runs/:id", get(tests::get_run))
        .route("/api/tests/runs/:id/stop", post(tests::stop_run))
        .route("/api/tests/runs/:id/resume", post(tests::resume_run))
        .route("/api/tests/runs/:id/results", get(tests::results))
        .route(
            "/api/tests/runs/:id/cases/:case_id/rerun",
            post(tests::rerun_case),
        )
        // Project
        .route("/api/project/export", post(project::export))
        .route("/api/project/import", post(project::import))
        // Traces
        .route("/api/traces", get(traces::list).post(traces::record))
        .route("/api/traces/:id", get(traces::get_trace))
        // Agents
        .route("/api/agents", get(agents::list).post(agents::upsert))
        .route(
            "/api/agents/:id",
            get(agents::get_agent).put(agents::upsert_by_id).delete(agents::delete_agent),
        )
        .route("/api/agents/:id/trigger", post(agents::trigger))
        .route("/api/agents/logs", get(agents::logs))
        // Credential resolution for everything above.
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_auth,
        ));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
