use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use sz_domain::config::{Config, ConfigSeverity};
use sz_gateway::api;
use sz_gateway::prompts::PromptCache;
use sz_gateway::runtime::agents::AgentService;
use sz_gateway::runtime::recovery;
use sz_gateway::runtime::testrun::TestService;
use sz_gateway::runtime::traces::TraceStore;
use sz_gateway::state::AppState;
use sz_gateway::users::UserStore;
use sz_index::VectorIndex;
use sz_providers::BackendRegistry;
use sz_registry::{SymbolIndexer, SymbolRegistry};
use sz_sessions::ContextStore;
use sz_store::{KvStore, MemoryStore};

#[derive(Parser)]
#[command(name = "signalzero", about = "The SignalZero symbolic-reasoning kernel")]
struct Cli {
    /// Path to the config file.
    #[arg(long, default_value = "signalzero.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the kernel (default).
    Serve,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Version) => {
            println!("signalzero {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sz_gateway=debug")),
        )
        .json()
        .init();
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let config = Config::from_toml(&raw)
                .with_context(|| format!("parsing config file {path}"))?;
            tracing::info!(path, "config loaded");
            Ok(config)
        }
        Err(_) => {
            tracing::info!(path, "no config file, using defaults");
            Ok(Config::default())
        }
    }
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("SignalZero starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        // The only fatal exit: a config the kernel cannot run with.
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Store (bounded retries, then degraded volatile fallback) ─────
    let degraded = Arc::new(AtomicBool::new(false));
    let store_dir = std::path::PathBuf::from(&config.store.path);
    let mut opened: Option<MemoryStore> = None;
    for attempt in 0..config.store.connect_retries.max(1) {
        match MemoryStore::open(&store_dir) {
            Ok(store) => {
                opened = Some(store);
                break;
            }
            Err(e) => {
                tracing::warn!(attempt = attempt + 1, error = %e, "store open failed");
                tokio::time::sleep(Duration::from_millis(500 << attempt.min(4))).await;
            }
        }
    }
    let memory_store = Arc::new(opened.unwrap_or_else(|| {
        tracing::error!("store image unavailable, serving degraded from a volatile store");
        degraded.store(true, Ordering::Release);
        MemoryStore::ephemeral()
    }));
    let kv: Arc<dyn KvStore> = memory_store.clone();
    tracing::info!("store ready");

    // ── LLM backends ─────────────────────────────────────────────────
    let backends = Arc::new(BackendRegistry::from_config(&config.llm));
    if backends.is_empty() {
        tracing::warn!("no LLM backends initialized — chat turns and search will fail");
    } else {
        tracing::info!(backends = backends.len(), "LLM backend registry ready");
    }

    // ── Registry + vector index ──────────────────────────────────────
    let registry = Arc::new(SymbolRegistry::new(kv.clone()));
    let index = Arc::new(VectorIndex::new(backends.clone()));
    registry.attach_indexer(index.clone() as Arc<dyn SymbolIndexer>);
    match registry.migrate_all().await {
        Ok(count) => tracing::info!(symbols = count, "registry migration pass complete"),
        Err(e) => tracing::warn!(error = %e, "registry migration skipped"),
    }
    tracing::info!("symbol registry ready");

    // ── Sessions / traces / agents / tests / prompts / users ─────────
    let contexts = Arc::new(ContextStore::new(kv.clone()));
    let traces = Arc::new(TraceStore::new(kv.clone()));
    let agents = Arc::new(AgentService::new(kv.clone()));
    let tests = Arc::new(TestService::new(kv.clone()));
    let prompts = Arc::new(
        PromptCache::load(kv.clone())
            .await
            .map_err(|e| anyhow::anyhow!("loading prompts: {e}"))?,
    );
    let users = Arc::new(UserStore::new(
        kv.clone(),
        Duration::from_secs(config.auth.token_ttl_hours * 3600),
    ));
    tracing::info!("session and runtime stores ready");

    // ── Internal service key (read once, hashed) ─────────────────────
    let internal_key_hash = match std::env::var(&config.auth.internal_key_env) {
        Ok(secret) if !secret.is_empty() => {
            tracing::info!(env_var = %config.auth.internal_key_env, "internal service key enabled");
            Some(Sha256::digest(secret.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = %config.auth.internal_key_env,
                "internal service key DISABLED — set it to enable x-internal-key"
            );
            None
        }
    };

    let state = AppState {
        config: config.clone(),
        kv,
        memory_store: Some(memory_store.clone()),
        backends,
        registry,
        index,
        contexts,
        traces,
        agents,
        tests,
        prompts,
        users,
        internal_key_hash,
        degraded,
    };

    // ── Crash recovery, before the scheduler can compete for locks ──
    match recovery::recover_open_sessions(&state).await {
        Ok(0) => {}
        Ok(resumed) => tracing::info!(resumed, "recovered interrupted turns"),
        Err(e) => tracing::warn!(error = %e, "recovery skipped"),
    }

    // ── Agent scheduler tick ─────────────────────────────────────────
    {
        let state = state.clone();
        let tick = Duration::from_secs(config.scheduler.tick_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                state.agents.tick(&state).await;
            }
        });
    }
    tracing::info!("agent scheduler started (1s tick)");

    // ── Periodic store flush ─────────────────────────────────────────
    {
        let store = memory_store.clone();
        let every = Duration::from_secs(config.store.flush_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(e) = store.flush() {
                    tracing::warn!(error = %e, "store flush failed");
                }
            }
        });
    }

    // ── Periodic sweeps: expired keys + stale test sessions ──────────
    {
        let store = memory_store.clone();
        let contexts = state.contexts.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let removed = store.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "expired keys swept");
                }
                if let Err(e) = contexts
                    .cleanup_test_sessions(Duration::from_secs(3600))
                    .await
                {
                    tracing::warn!(error = %e, "test session cleanup failed");
                }
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.allowed_origins);
    let app = api::router(state.clone())
        .layer(cors_layer)
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "SignalZero listening");

    axum::serve(listener, app)
        .await
        .context("axum server error")?;
    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may carry a trailing `:*` wildcard for the port segment
/// (e.g. `http://localhost:*`). A literal `"*"` allows all origins.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::header;

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();
    for origin in allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            // Wildcard ports must be all digits so a crafted origin like
            // "http://localhost:3000.evil.com" cannot slip through.
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
