//! The tool-calling inference loop — one chat turn from user message to
//! final model turn, dispatching tool calls along the way.
//!
//! The caller owns the active-message lock before spawning the turn; the
//! loop records all results into session history, releases the lock when
//! done, and drains the next queued message if one is waiting.

use serde_json::json;

use sz_domain::auth::AuthContext;
use sz_domain::context::{Turn, TurnRole};
use sz_domain::testset::Evaluation;
use sz_domain::tool::Message;
use sz_domain::{Error, Result};
use sz_providers::retry::with_retry;
use sz_providers::ChatRequest;

use crate::runtime::tools::{build_tool_definitions, ToolExecutor};
use crate::state::AppState;

/// Input to one turn. The active-message lock for `session_id` is held
/// with `message_id` before this is constructed.
#[derive(Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub message_id: String,
    pub message: String,
    pub auth: AuthContext,
    /// False when re-running a recovered turn whose user entry is
    /// already in history.
    pub record_user: bool,
}

/// Fire-and-forget entry point. All results land in history and traces.
pub fn spawn_turn(state: AppState, req: TurnRequest) {
    let span = tracing::info_span!(
        "turn",
        session_id = %req.session_id,
        message_id = %req.message_id,
    );
    tokio::spawn(tracing::Instrument::instrument(
        async move {
            process_message(state, req).await;
        },
        span,
    ));
}

/// Run the turn, then release the lock and drain the queue. Never
/// propagates an error: failures become history turns.
pub async fn process_message(state: AppState, req: TurnRequest) {
    tracing::debug!("turn started");
    if let Err(e) = run_loop(&state, &req).await {
        tracing::warn!(error = %e, "turn failed");
        let turn = Turn::model(&req.message_id, format!("[error] {e}"))
            .with_metadata(json!({ "error": true }));
        if let Err(e) = state
            .contexts
            .record_message(&req.session_id, turn, &AuthContext::internal())
            .await
        {
            tracing::warn!(error = %e, "failed to record error turn");
        }
    }

    let internal = AuthContext::internal();
    if let Err(e) = state
        .contexts
        .clear_active_message(&req.session_id, &internal)
        .await
    {
        tracing::warn!(error = %e, "failed to release session lock");
    }

    drain_queue(state, req.session_id).await;
}

/// Pop the next queued message (if any) and start a turn for it with a
/// synthetic `queued-<ts>` message id. The lock is taken before the pop
/// so a racing worker cannot double-process the head.
pub async fn drain_queue(state: AppState, session_id: String) {
    let internal = AuthContext::internal();
    match state
        .contexts
        .has_queued_messages(&session_id, &internal)
        .await
    {
        Ok(true) => {}
        _ => return,
    }

    let message_id = format!("queued-{}", chrono::Utc::now().timestamp_millis());
    match state
        .contexts
        .set_active_message(&session_id, &message_id, &internal)
        .await
    {
        Ok(()) => {}
        Err(Error::Busy(_)) => return, // another worker owns the drain
        Err(e) => {
            tracing::warn!(error = %e, "queue drain could not take the lock");
            return;
        }
    }

    let popped = match state.contexts.pop_next_message(&session_id, &internal).await {
        Ok(Some(queued)) => queued,
        Ok(None) => {
            let _ = state
                .contexts
                .clear_active_message(&session_id, &internal)
                .await;
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "queue pop failed");
            let _ = state
                .contexts
                .clear_active_message(&session_id, &internal)
                .await;
            return;
        }
    };

    tracing::info!(session_id = %session_id, source_id = %popped.source_id, "processing queued message");
    spawn_turn(
        state,
        TurnRequest {
            session_id,
            message_id,
            message: popped.message,
            auth: internal,
            record_user: true,
        },
    );
}

async fn run_loop(state: &AppState, req: &TurnRequest) -> Result<()> {
    let max_steps = state.config.runtime.max_steps;
    let retries = state.config.runtime.llm_retry_attempts;

    // 1. Expand attachments and record the user turn.
    let message = expand_attachments(state, &req.message).await;
    if req.record_user {
        state
            .contexts
            .record_message(
                &req.session_id,
                Turn {
                    id: req.message_id.clone(),
                    role: TurnRole::User,
                    content: message.clone(),
                    timestamp: chrono::Utc::now(),
                    correlation_id: req.message_id.clone(),
                    metadata: None,
                },
                &req.auth,
            )
            .await?;
    }

    // 2. Assemble the request: activation prompt, prior history, tools.
    let history = state
        .contexts
        .get_history(&req.session_id, &req.auth)
        .await?;
    let mut messages = vec![Message::system(state.prompts.system_prompt())];
    messages.extend(history_to_messages(&history));

    let tool_defs = build_tool_definitions();
    let executor = ToolExecutor::new(
        state.clone(),
        Some(req.session_id.clone()),
        true,
        req.auth.clone(),
    );
    let backend = state.backends.primary()?;

    // 3. The bounded model ↔ tool loop.
    for step in 0..max_steps {
        if self_cancelled(state, &req.session_id).await {
            return record_cancelled(state, req).await;
        }

        let chat_req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            temperature: Some(0.2),
            ..Default::default()
        };
        tracing::debug!(step, "llm call");
        let response = with_retry(retries, || backend.chat(chat_req.clone())).await?;

        if self_cancelled(state, &req.session_id).await {
            return record_cancelled(state, req).await;
        }

        if response.is_final() {
            state
                .contexts
                .record_message(
                    &req.session_id,
                    Turn::model(&req.message_id, response.content),
                    &req.auth,
                )
                .await?;
            return Ok(());
        }

        // Tool dispatch: each call runs through the authorization-scoped
        // executor; results feed both history and the next model request.
        messages.push(Message::assistant_tool_calls(
            &response.content,
            &response.tool_calls,
        ));
        for call in &response.tool_calls {
            if self_cancelled(state, &req.session_id).await {
                return record_cancelled(state, req).await;
            }
            let tool_span = tracing::info_span!("tool.call", tool_name = %call.tool_name);
            let (result, is_error) = tracing::Instrument::instrument(
                executor.execute(&call.tool_name, &call.arguments),
                tool_span,
            )
            .await;

            state
                .contexts
                .record_message(
                    &req.session_id,
                    Turn::tool(
                        &req.message_id,
                        json!({
                            "tool_name": call.tool_name,
                            "call_id": call.call_id,
                            "result": result,
                            "is_error": is_error,
                        })
                        .to_string(),
                    ),
                    &req.auth,
                )
                .await?;
            messages.push(Message::tool_result(&call.call_id, &result));
        }
    }

    // 4. Budget exhausted: a success path, recorded as a model turn.
    state
        .contexts
        .record_message(
            &req.session_id,
            Turn::model(
                &req.message_id,
                format!("Step budget exceeded after {max_steps} tool rounds."),
            )
            .with_metadata(json!({ "budget_exceeded": true })),
            &req.auth,
        )
        .await?;
    Ok(())
}

async fn self_cancelled(state: &AppState, session_id: &str) -> bool {
    state
        .contexts
        .is_cancellation_requested(session_id)
        .await
        .unwrap_or(false)
}

async fn record_cancelled(state: &AppState, req: &TurnRequest) -> Result<()> {
    tracing::info!(session_id = %req.session_id, "turn cancelled");
    state
        .contexts
        .record_message(
            &req.session_id,
            Turn::model(&req.message_id, "Turn cancelled by request.")
                .with_metadata(json!({ "cancelled": true })),
            &req.auth,
        )
        .await
}

/// Replace `[attachment:<id>]` markers with the stored attachment text.
/// Expired or unknown attachments leave the marker in place.
async fn expand_attachments(state: &AppState, message: &str) -> String {
    if !message.contains("[attachment:") {
        return message.to_owned();
    }
    let mut result = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find("[attachment:") {
        result.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find(']') {
            Some(end) => {
                let id = &tail["[attachment:".len()..end];
                match state.kv.get(&format!("attachment:{id}")).await {
                    Ok(Some(content)) => result.push_str(&content),
                    _ => result.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                result.push_str(tail);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn history_to_messages(history: &[Turn]) -> Vec<Message> {
    history
        .iter()
        .filter_map(|turn| match turn.role {
            TurnRole::User => Some(Message::user(&turn.content)),
            TurnRole::Model => Some(Message::assistant(&turn.content)),
            // Tool turns only matter inside their own round-trip; the
            // structured results are not replayed across turns.
            TurnRole::Tool => None,
        })
        .collect()
}

// ── Test-runner model calls ────────────────────────────────────────

/// Baseline (no-tools) model output for comparison runs.
pub async fn run_baseline_test(state: &AppState, prompt: &str) -> Result<String> {
    let backend = state.backends.baseline()?;
    let response = with_retry(state.config.runtime.llm_retry_attempts, || {
        backend.chat(ChatRequest {
            messages: vec![Message::user(prompt)],
            ..Default::default()
        })
    })
    .await?;
    Ok(response.content)
}

const COMPARISON_RUBRIC: &str = "\
You are scoring two answers to the same prompt. Score the FIRST answer \
(produced with a symbol registry) against the SECOND (a plain baseline) \
on accuracy, depth and coherence, each 0-10. Respond with JSON only: \
{\"accuracy\": n, \"depth\": n, \"coherence\": n, \"reasoning\": \"...\"}";

/// Judge the registry-grounded response against the baseline with a
/// fixed rubric.
pub async fn evaluate_comparison(
    state: &AppState,
    signal_zero: &str,
    baseline: &str,
) -> Result<Evaluation> {
    let backend = state.backends.judge()?;
    let response = with_retry(state.config.runtime.llm_retry_attempts, || {
        backend.chat(ChatRequest {
            messages: vec![
                Message::system(COMPARISON_RUBRIC),
                Message::user(format!(
                    "FIRST ANSWER:\n{signal_zero}\n\nSECOND ANSWER:\n{baseline}"
                )),
            ],
            json_mode: true,
            ..Default::default()
        })
    })
    .await?;

    let parsed: serde_json::Value = serde_json::from_str(response.content.trim())
        .map_err(|e| Error::Backend {
            backend: "judge".into(),
            message: format!("rubric response was not JSON: {e}"),
        })?;
    Ok(Evaluation {
        accuracy: parsed["accuracy"].as_f64().unwrap_or(0.0) as f32,
        depth: parsed["depth"].as_f64().unwrap_or(0.0) as f32,
        coherence: parsed["coherence"].as_f64().unwrap_or(0.0) as f32,
        reasoning: parsed["reasoning"].as_str().unwrap_or_default().to_owned(),
    })
}
