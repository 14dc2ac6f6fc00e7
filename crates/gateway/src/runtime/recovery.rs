//! Startup crash recovery.
//!
//! Any session left `open` with an active message id was mid-turn when
//! the process died. The turn is re-run with the original message id so
//! client correlation stays stable; sessions with no user turn carry a
//! stale lock artifact that is simply cleared. Runs before the scheduler
//! starts so recovery and the scheduler never compete for agent
//! sessions.

use sz_domain::auth::AuthContext;
use sz_domain::Result;

use crate::runtime::turn::{spawn_turn, TurnRequest};
use crate::state::AppState;

/// Re-enter every interrupted turn. Returns how many were resumed.
pub async fn recover_open_sessions(state: &AppState) -> Result<usize> {
    let internal = AuthContext::internal();
    let stale = state.contexts.stale_open_sessions().await?;
    let mut resumed = 0;

    for session in stale {
        let Some(message_id) = session.active_message_id.clone() else {
            continue;
        };
        match state.contexts.last_user_turn(&session.id).await {
            Ok(Some(user_turn)) => {
                tracing::info!(
                    session_id = %session.id,
                    message_id = %message_id,
                    "recovering interrupted turn"
                );
                // Keep the original lock holder; just reset cancellation.
                if let Err(e) = state
                    .contexts
                    .force_active_message(&session.id, &message_id)
                    .await
                {
                    tracing::warn!(session_id = %session.id, error = %e, "recovery could not re-arm the lock");
                    continue;
                }
                spawn_turn(
                    state.clone(),
                    TurnRequest {
                        session_id: session.id.clone(),
                        message_id,
                        message: user_turn.content,
                        auth: internal.clone(),
                        // The user turn is already in history.
                        record_user: false,
                    },
                );
                resumed += 1;
            }
            Ok(None) => {
                tracing::warn!(session_id = %session.id, "clearing stale lock with no user turn");
                if let Err(e) = state
                    .contexts
                    .clear_active_message(&session.id, &internal)
                    .await
                {
                    tracing::warn!(session_id = %session.id, error = %e, "failed to clear stale lock");
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "recovery skipped session");
            }
        }
    }
    Ok(resumed)
}
