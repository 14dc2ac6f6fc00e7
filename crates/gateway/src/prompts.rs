//! Process-wide prompt state: the activation (system) prompt and the MCP
//! prompt.
//!
//! Both are low-frequency, advisory singletons: initialized from the
//! store at startup, write-through on update, cached readers may lag a
//! write by one reload on other workers.

use std::sync::Arc;

use parking_lot::RwLock;

use sz_domain::Result;
use sz_store::KvStore;

const SYSTEM_PROMPT_KEY: &str = "sz:prompt:system";
const MCP_PROMPT_KEY: &str = "sz:prompt:mcp";

/// The prompt used when nothing has been persisted yet.
pub const DEFAULT_ACTIVATION_PROMPT: &str = "\
You are the SignalZero symbolic-reasoning kernel. Ground every answer in \
the symbol registry: search for relevant symbols, follow their links, and \
log an activation trace for each reasoning chain you complete.";

pub const DEFAULT_MCP_PROMPT: &str = "\
SignalZero control channel. Use the exposed tools to read the symbol \
registry; mutations require an admin key.";

pub struct PromptCache {
    kv: Arc<dyn KvStore>,
    system: RwLock<String>,
    mcp: RwLock<String>,
}

impl PromptCache {
    /// Initialize from the store, falling back to the built-in defaults.
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let system = kv
            .get(SYSTEM_PROMPT_KEY)
            .await?
            .unwrap_or_else(|| DEFAULT_ACTIVATION_PROMPT.to_owned());
        let mcp = kv
            .get(MCP_PROMPT_KEY)
            .await?
            .unwrap_or_else(|| DEFAULT_MCP_PROMPT.to_owned());
        Ok(Self {
            kv,
            system: RwLock::new(system),
            mcp: RwLock::new(mcp),
        })
    }

    pub fn system_prompt(&self) -> String {
        self.system.read().clone()
    }

    pub fn mcp_prompt(&self) -> String {
        self.mcp.read().clone()
    }

    /// Persist, then update the in-memory copy.
    pub async fn set_system_prompt(&self, prompt: &str) -> Result<()> {
        self.kv.set(SYSTEM_PROMPT_KEY, prompt).await?;
        *self.system.write() = prompt.to_owned();
        Ok(())
    }

    pub async fn set_mcp_prompt(&self, prompt: &str) -> Result<()> {
        self.kv.set(MCP_PROMPT_KEY, prompt).await?;
        *self.mcp.write() = prompt.to_owned();
        Ok(())
    }
}
