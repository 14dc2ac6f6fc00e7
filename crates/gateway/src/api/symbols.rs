//! Symbol endpoints: CRUD, query, semantic search, refactor/compress and
//! index maintenance.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;

use sz_domain::auth::AuthContext;
use sz_domain::symbol::Symbol;
use sz_domain::Error;
use sz_registry::{RefactorUpdate, SearchOptions};

use crate::api::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn get_symbol(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Symbol>> {
    Ok(Json(state.registry.find_by_id(&id, &auth).await?))
}

pub async fn list_in_domain(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let symbols = state.registry.get_symbols(&id, &auth).await?;
    Ok(Json(serde_json::json!({ "domain": id, "symbols": symbols })))
}

pub async fn upsert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(symbol): Json<Symbol>,
) -> ApiResult<Json<Symbol>> {
    Ok(Json(state.registry.upsert_symbol(&id, symbol, &auth).await?))
}

#[derive(Deserialize)]
pub struct BulkBody {
    pub symbols: Vec<Symbol>,
    /// Explicit, caller-provided: skips reference existence checks for
    /// loads that carry cross-domain/external links.
    #[serde(default, rename = "bypassValidation")]
    pub bypass_validation: bool,
}

pub async fn bulk_upsert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<BulkBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .registry
        .bulk_upsert(&id, body.symbols, body.bypass_validation, &auth)
        .await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::Json)?))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    /// Named option; the wire form is `?cascade=true|false`.
    #[serde(default)]
    pub cascade: Option<String>,
}

pub async fn delete_symbol(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((id, symbol_id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let cascade = matches!(query.cascade.as_deref(), Some("true") | Some("1"));
    state
        .registry
        .delete_symbol(&id, &symbol_id, cascade, &auth)
        .await?;
    Ok(Json(serde_json::json!({
        "status": "deleted",
        "id": symbol_id,
        "cascade": cascade,
    })))
}

#[derive(Deserialize)]
pub struct RenameBody {
    #[serde(rename = "oldId")]
    pub old_id: String,
    #[serde(rename = "newId")]
    pub new_id: String,
}

pub async fn rename(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> ApiResult<Json<Symbol>> {
    let renamed = state
        .registry
        .propagate_rename(&id, &body.old_id, &body.new_id, &auth)
        .await?;
    Ok(Json(renamed))
}

#[derive(Deserialize)]
pub struct QueryParams {
    pub tag: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(rename = "lastId")]
    pub last_id: Option<String>,
}

fn default_limit() -> usize {
    50
}

pub async fn query(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(params): Query<QueryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let page = state
        .registry
        .query(
            &id,
            &auth,
            params.tag.as_deref(),
            params.limit,
            params.last_id.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::to_value(page).map_err(Error::Json)?))
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    #[serde(default = "search_limit")]
    pub limit: usize,
    pub time_gte: Option<String>,
    /// Comma-separated pair of stamps.
    pub time_between: Option<String>,
    /// Comma-separated domain ids.
    pub domains: Option<String>,
}

fn search_limit() -> usize {
    20
}

pub async fn search(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let time_between = match &params.time_between {
        Some(raw) => {
            let (lo, hi) = raw.split_once(',').ok_or_else(|| {
                ApiError(Error::InvalidRequest(
                    "time_between must be two comma-separated stamps".into(),
                ))
            })?;
            Some((lo.to_owned(), hi.to_owned()))
        }
        None => None,
    };
    let opts = SearchOptions {
        limit: params.limit,
        time_gte: params.time_gte,
        time_between,
        metadata_filter: None,
        domains: params
            .domains
            .map(|raw| raw.split(',').map(str::to_owned).collect()),
    };
    let hits = state
        .registry
        .search(params.q.as_deref(), &auth, opts)
        .await?;
    Ok(Json(serde_json::json!({ "results": hits })))
}

#[derive(Deserialize)]
pub struct RefactorBody {
    pub updates: Vec<RefactorUpdate>,
}

pub async fn refactor(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RefactorBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .registry
        .process_refactor_operation(body.updates, &auth)
        .await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::Json)?))
}

#[derive(Deserialize)]
pub struct CompressBody {
    #[serde(rename = "newSymbol")]
    pub new_symbol: Symbol,
    #[serde(rename = "oldIds")]
    pub old_ids: Vec<String>,
}

pub async fn compress(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CompressBody>,
) -> ApiResult<Json<Symbol>> {
    let merged = state
        .registry
        .compress_symbols(body.new_symbol, &body.old_ids, &auth)
        .await?;
    Ok(Json(merged))
}

// ── Index maintenance ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReindexBody {
    #[serde(default, rename = "includeDisabled")]
    pub include_disabled: bool,
}

pub async fn reindex(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ReindexBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if !auth.is_admin() {
        return Err(ApiError(Error::Forbidden("reindex requires admin".into())));
    }
    let report = state
        .index
        .reindex(&state.registry, body.include_disabled)
        .await?;
    Ok(Json(serde_json::to_value(report).map_err(Error::Json)?))
}

pub async fn index_status(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(serde_json::json!({
        "count": state.index.count_collection(),
        "rebuild": state.index.reindex_progress(),
    })))
}
