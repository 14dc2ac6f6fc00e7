//! Credential resolution middleware and the auth bootstrap endpoints.
//!
//! Accepted credentials, in precedence order:
//! - `x-internal-key` — compared in constant time against the hashed
//!   env secret; grants a synthetic admin context.
//! - `Authorization: Bearer <token>` or `x-auth-token` — session token.
//! - `x-api-key` — per-user API key.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use sz_domain::auth::AuthContext;
use sz_domain::Error;

use crate::api::{ApiError, ApiResult};
use crate::state::AppState;

/// Resolve a credential from the request headers, if any is valid.
pub async fn resolve_credentials(state: &AppState, headers: &HeaderMap) -> Option<AuthContext> {
    // Service-to-service secret first: it does not hit the user store.
    if let (Some(expected_hash), Some(provided)) = (
        state.internal_key_hash.as_ref(),
        headers.get("x-internal-key").and_then(|v| v.to_str().ok()),
    ) {
        let provided_hash = Sha256::digest(provided.as_bytes());
        if bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
            return Some(AuthContext::internal());
        }
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-auth-token").and_then(|v| v.to_str().ok()));
    if let Some(token) = token {
        if let Ok(Some(ctx)) = state.users.resolve_token(token).await {
            return Some(ctx);
        }
    }

    if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if let Ok(Some(ctx)) = state.users.resolve_api_key(api_key).await {
            return Some(ctx);
        }
    }
    None
}

/// Axum middleware for the protected route tree: resolves an
/// [`AuthContext`] into request extensions or answers 401. The 401 body
/// never says whether the target resource exists.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match resolve_credentials(&state, req.headers()).await {
        Some(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid or missing credentials" })),
        )
            .into_response(),
    }
}

// ── Endpoints ──────────────────────────────────────────────────────

pub async fn status(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let initialized = state.users.is_initialized().await?;
    Ok(Json(serde_json::json!({ "initialized": initialized })))
}

#[derive(Deserialize)]
pub struct CredentialsBody {
    pub username: String,
    pub password: String,
}

/// First-run setup: creates the initial admin account.
pub async fn setup(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state
        .users
        .setup_admin(&body.username, &body.password)
        .await?;
    Ok(Json(serde_json::json!({ "user": user })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (token, ctx) = state.users.login(&body.username, &body.password).await?;
    Ok(Json(serde_json::json!({
        "token": token,
        "user": {
            "id": ctx.user_id,
            "username": ctx.username,
            "role": ctx.role,
        }
    })))
}

#[derive(Deserialize)]
pub struct ChangePasswordBody {
    pub current_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ChangePasswordBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if auth.user_id.is_none() {
        // The synthetic internal identity has no password.
        return Err(ApiError(Error::InvalidRequest(
            "service identity has no password".into(),
        )));
    }
    state
        .users
        .change_password(&auth, &body.current_password, &body.new_password)
        .await?;
    Ok(Json(serde_json::json!({ "status": "changed" })))
}
