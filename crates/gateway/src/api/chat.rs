//! Chat endpoints — submit a turn, or cancel the in-flight one.
//!
//! `POST /api/chat` answers 202 immediately: the turn runs in the
//! background and all results land in session history. A second chat
//! for a busy session answers 409.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::Extension;
use serde::Deserialize;

use sz_domain::auth::AuthContext;

use crate::api::ApiResult;
use crate::runtime::turn::{spawn_turn, TurnRequest};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(rename = "contextSessionId")]
    pub context_session_id: String,
    /// Client-chosen id for turn correlation; generated when absent.
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
}

pub async fn chat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ChatBody>,
) -> ApiResult<impl IntoResponse> {
    if body.message.trim().is_empty() {
        return Err(sz_domain::Error::InvalidRequest("message is required".into()).into());
    }
    let message_id = body
        .message_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Acquire the per-session lock; Busy maps to 409.
    state
        .contexts
        .set_active_message(&body.context_session_id, &message_id, &auth)
        .await?;

    spawn_turn(
        state.clone(),
        TurnRequest {
            session_id: body.context_session_id.clone(),
            message_id: message_id.clone(),
            message: body.message,
            auth,
            record_user: true,
        },
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "processing",
            "contextSessionId": body.context_session_id,
            "messageId": message_id,
        })),
    ))
}

#[derive(Deserialize)]
pub struct StopBody {
    #[serde(rename = "contextSessionId")]
    pub context_session_id: String,
}

/// Request cooperative cancellation; the loop observes it at its next
/// suspension point.
pub async fn stop(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<StopBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let requested = state
        .contexts
        .request_cancellation(&body.context_session_id, &auth)
        .await?;
    Ok(Json(serde_json::json!({
        "status": if requested { "cancellation requested" } else { "idle" },
        "contextSessionId": body.context_session_id,
    })))
}
