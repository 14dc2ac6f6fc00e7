//! Project export/import: a zip archive (`project.szproject`) holding
//! domains, symbols, prompts, test sets, agents and a meta record.

use std::io::{Cursor, Read, Write};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use sz_domain::agent::Agent;
use sz_domain::auth::AuthContext;
use sz_domain::domain::Domain;
use sz_domain::symbol::Symbol;
use sz_domain::testset::TestSet;
use sz_domain::{stamp, Error};

use crate::api::{ApiError, ApiResult};
use crate::state::AppState;

const ENTRY_DOMAINS: &str = "domains.json";
const ENTRY_SYMBOLS: &str = "symbols.json";
const ENTRY_AGENTS: &str = "agents.json";
const ENTRY_TEST_SETS: &str = "test_sets.json";
const ENTRY_PROMPTS: &str = "prompts.json";
const ENTRY_META: &str = "meta.json";

pub async fn export(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Response> {
    if !auth.is_admin() {
        return Err(ApiError(Error::Forbidden("export requires admin".into())));
    }
    let internal = AuthContext::internal();

    let domains = state.registry.list_domains(&internal).await?;
    let mut symbols: Vec<Symbol> = Vec::new();
    for domain in &domains {
        symbols.extend(state.registry.get_symbols(&domain.id, &internal).await?);
    }
    // Stable entry order keeps exports diffable.
    symbols.sort_by(|a, b| a.id.cmp(&b.id));

    let agents = state.agents.list().await?;
    let test_sets = state.tests.list_sets().await?;
    let prompts = serde_json::json!({
        "system": state.prompts.system_prompt(),
        "mcp": state.prompts.mcp_prompt(),
    });
    let meta = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "exported_at": stamp::now(),
        "domain_count": domains.len(),
        "symbol_count": symbols.len(),
    });

    let archive = build_archive(&[
        (ENTRY_DOMAINS, serde_json::to_vec_pretty(&domains)?),
        (ENTRY_SYMBOLS, serde_json::to_vec_pretty(&symbols)?),
        (ENTRY_AGENTS, serde_json::to_vec_pretty(&agents)?),
        (ENTRY_TEST_SETS, serde_json::to_vec_pretty(&test_sets)?),
        (ENTRY_PROMPTS, serde_json::to_vec_pretty(&prompts)?),
        (ENTRY_META, serde_json::to_vec_pretty(&meta)?),
    ])?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"project.szproject\"".to_owned(),
            ),
        ],
        archive,
    )
        .into_response())
}

fn build_archive(entries: &[(&str, Vec<u8>)]) -> Result<Vec<u8>, Error> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options: FileOptions = FileOptions::default();
    for (name, bytes) in entries {
        writer
            .start_file(*name, options)
            .map_err(|e| Error::Other(format!("zip entry {name}: {e}")))?;
        writer.write_all(bytes).map_err(Error::Io)?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| Error::Other(format!("zip finish: {e}")))?;
    Ok(cursor.into_inner())
}

#[derive(Deserialize)]
pub struct ImportBody {
    /// The archive, base64-encoded.
    pub data: String,
}

/// Replace-all import: wipes registry/agents/test sets, restores the
/// archive contents, then rebuilds the vector index in the background.
pub async fn import(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ImportBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if !auth.is_admin() {
        return Err(ApiError(Error::Forbidden("import requires admin".into())));
    }
    let bytes = BASE64
        .decode(body.data.as_bytes())
        .map_err(|e| ApiError(Error::InvalidRequest(format!("data is not base64: {e}"))))?;
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ApiError(Error::InvalidRequest(format!("not a project archive: {e}"))))?;

    let domains: Vec<Domain> = read_entry(&mut archive, ENTRY_DOMAINS)?;
    let symbols: Vec<Symbol> = read_entry(&mut archive, ENTRY_SYMBOLS)?;
    let agents: Vec<Agent> = read_entry(&mut archive, ENTRY_AGENTS)?;
    let test_sets: Vec<TestSet> = read_entry(&mut archive, ENTRY_TEST_SETS)?;
    let prompts: serde_json::Value = read_entry(&mut archive, ENTRY_PROMPTS)?;

    let internal = AuthContext::internal();
    state.registry.clear_all(&internal).await?;
    for domain in &domains {
        state.registry.restore_domain(domain, &internal).await?;
    }
    let mut restored = 0;
    for symbol in &symbols {
        match state.registry.restore_symbol(symbol, &internal).await {
            Ok(()) => restored += 1,
            Err(e) => {
                tracing::warn!(symbol_id = %symbol.id, error = %e, "import skipped symbol")
            }
        }
    }
    state.agents.replace_all_agents(agents).await?;
    state.tests.replace_all_sets(test_sets).await?;
    if let Some(system) = prompts.get("system").and_then(|v| v.as_str()) {
        state.prompts.set_system_prompt(system).await?;
    }
    if let Some(mcp) = prompts.get("mcp").and_then(|v| v.as_str()) {
        state.prompts.set_mcp_prompt(mcp).await?;
    }

    // Rebuild the index off-request; restores already indexed best-effort.
    {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = state.index.reindex(&state.registry, true).await {
                tracing::warn!(error = %e, "post-import reindex failed");
            }
        });
    }

    tracing::info!(domains = domains.len(), symbols = restored, "project imported");
    Ok(Json(serde_json::json!({
        "status": "imported",
        "domains": domains.len(),
        "symbols": restored,
    })))
}

fn read_entry<T: serde::de::DeserializeOwned>(
    archive: &mut ZipArchive<Cursor<Vec<u8>>>,
    name: &str,
) -> Result<T, ApiError> {
    let mut file = archive
        .by_name(name)
        .map_err(|_| ApiError(Error::InvalidRequest(format!("archive missing {name}"))))?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)
        .map_err(|e| ApiError(Error::Io(e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| ApiError(Error::InvalidRequest(format!("bad {name}: {e}"))))
}
