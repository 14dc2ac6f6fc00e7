//! Domain endpoints.

use axum::extract::{Path, State};
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;

use sz_domain::auth::AuthContext;
use sz_domain::domain::Domain;

use crate::api::ApiResult;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    let summaries = state.registry.get_metadata(&auth).await?;
    Ok(Json(serde_json::json!({ "domains": summaries })))
}

#[derive(Deserialize)]
pub struct CreateDomainBody {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub invariants: Vec<String>,
    /// Admins may create global domains by leaving this unset.
    #[serde(default, rename = "ownerUserId")]
    pub owner_user_id: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateDomainBody>,
) -> ApiResult<Json<Domain>> {
    let domain = state
        .registry
        .create_domain(
            &body.id,
            &body.name,
            &body.description,
            body.invariants,
            body.owner_user_id,
            &auth,
        )
        .await?;
    Ok(Json(domain))
}

#[derive(Deserialize)]
pub struct UpdateDomainBody {
    pub name: Option<String>,
    pub description: Option<String>,
    pub invariants: Option<Vec<String>>,
    #[serde(rename = "readOnly")]
    pub read_only: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateDomainBody>,
) -> ApiResult<Json<Domain>> {
    let domain = state
        .registry
        .update_domain_metadata(
            &id,
            body.name,
            body.description,
            body.invariants,
            body.read_only,
            &auth,
        )
        .await?;
    Ok(Json(domain))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.delete_domain(&id, &auth).await?;
    Ok(Json(serde_json::json!({ "status": "deleted", "id": id })))
}

pub async fn exists(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let exists = state.registry.domain_exists(&id, &auth).await?;
    Ok(Json(serde_json::json!({ "id": id, "exists": exists })))
}

pub async fn enabled(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let domain = state.registry.get_visible_domain(&id, &auth).await?;
    Ok(Json(serde_json::json!({ "id": id, "enabled": domain.enabled })))
}

#[derive(Deserialize)]
pub struct ToggleBody {
    pub enabled: bool,
}

pub async fn toggle(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> ApiResult<Json<Domain>> {
    let domain = state
        .registry
        .toggle_domain(&id, body.enabled, &auth)
        .await?;
    Ok(Json(domain))
}
