//! User management endpoints. Admin-only except `GET /api/users/me`.

use axum::extract::{Path, State};
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;

use sz_domain::auth::{AuthContext, Role};
use sz_domain::user::UserView;
use sz_domain::Error;

use crate::api::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<UserView>>> {
    Ok(Json(state.users.list(&auth).await?))
}

#[derive(Deserialize)]
pub struct CreateUserBody {
    pub username: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateUserBody>,
) -> ApiResult<Json<UserView>> {
    let user = state
        .users
        .create_user(&body.username, &body.password, body.role, &auth)
        .await?;
    Ok(Json(user))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    match &auth.user_id {
        Some(id) => {
            let user = state.users.get(id).await?;
            Ok(Json(serde_json::json!({
                "user": UserView::from(&user),
                "apiKey": user.api_key,
            })))
        }
        None => Ok(Json(serde_json::json!({
            "user": { "role": auth.role, "internal": true }
        }))),
    }
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<UserView>> {
    if !auth.is_admin() {
        return Err(ApiError(Error::Forbidden(
            "user management requires admin".into(),
        )));
    }
    let user = state.users.get(&id).await?;
    Ok(Json(UserView::from(&user)))
}

#[derive(Deserialize)]
pub struct UpdateUserBody {
    pub role: Option<Role>,
    pub enabled: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateUserBody>,
) -> ApiResult<Json<UserView>> {
    let user = state
        .users
        .update_user(&id, body.role, body.enabled, &auth)
        .await?;
    Ok(Json(user))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.users.delete_user(&id, &auth).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

pub async fn mint_api_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let api_key = state.users.mint_api_key(&id, &auth).await?;
    Ok(Json(serde_json::json!({ "apiKey": api_key })))
}
