use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sz_domain::config::Config;
use sz_index::VectorIndex;
use sz_providers::BackendRegistry;
use sz_registry::SymbolRegistry;
use sz_sessions::ContextStore;
use sz_store::{KvStore, MemoryStore};

use crate::prompts::PromptCache;
use crate::runtime::agents::AgentService;
use crate::runtime::testrun::TestService;
use crate::runtime::traces::TraceStore;
use crate::users::UserStore;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, store, LLM backends
/// - **Registry** — symbols/domains plus the vector index
/// - **Sessions & runtime** — context sessions, traces, agents, tests
/// - **Security** — user store, hashed internal service key
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    /// The capability every service talks to.
    pub kv: Arc<dyn KvStore>,
    /// Concrete handle for flush/sweep maintenance. `None` when a
    /// non-bundled store implementation is wired in.
    pub memory_store: Option<Arc<MemoryStore>>,
    pub backends: Arc<BackendRegistry>,

    // ── Registry & index ──────────────────────────────────────────────
    pub registry: Arc<SymbolRegistry>,
    pub index: Arc<VectorIndex>,

    // ── Sessions & runtime ────────────────────────────────────────────
    pub contexts: Arc<ContextStore>,
    pub traces: Arc<TraceStore>,
    pub agents: Arc<AgentService>,
    pub tests: Arc<TestService>,
    pub prompts: Arc<PromptCache>,

    // ── Security (startup-computed) ───────────────────────────────────
    pub users: Arc<UserStore>,
    /// SHA-256 of the internal service key. `None` = header disabled.
    pub internal_key_hash: Option<Vec<u8>>,

    /// Set when the persisted store image could not be opened and the
    /// kernel fell back to a volatile store.
    pub degraded: Arc<AtomicBool>,
}

impl AppState {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}
