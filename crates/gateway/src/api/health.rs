//! Health probe. Public; reports degraded rather than failing when a
//! dependency is down.

use axum::extract::State;
use axum::response::Json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store_ok = state.kv.ping().await.is_ok();
    let degraded = state.is_degraded() || !store_ok;

    Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "store": if store_ok { "ok" } else { "unreachable" },
        "backends": state.backends.len(),
        "indexed_symbols": state.index.count_collection(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
