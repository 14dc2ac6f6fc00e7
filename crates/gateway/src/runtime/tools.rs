//! The tool executor: a closed set of named operations the model can
//! invoke, with structured argument schemas, per-call authorization and
//! trace capture.
//!
//! Tool errors never abort the inference loop — they are returned to the
//! model as `{error, code}` payloads so it can recover.

use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Value};

use sz_domain::auth::AuthContext;
use sz_domain::symbol::Symbol;
use sz_domain::tool::ToolDefinition;
use sz_domain::trace::Trace;
use sz_domain::{Error, Result};
use sz_registry::{RefactorUpdate, SearchOptions};

use crate::state::AppState;

/// Tools always hidden from the MCP channel.
pub const RESTRICTED_TOOLS: &[&str] = &[
    "send_user_message",
    "list_agents",
    "trigger_agent",
    "list_test_sets",
    "rename_symbol",
    "compress_symbols",
    "refactor_symbols",
    "web_fetch",
    "web_search",
    "set_system_prompt",
];

/// Tools hidden from the MCP channel unless the caller is an admin.
pub const ADMIN_TOOLS: &[&str] = &["upsert_symbols", "delete_symbols", "create_domain"];

/// Tools that mutate state; rejected when the owning session is closed.
const WRITE_TOOLS: &[&str] = &[
    "upsert_symbols",
    "delete_symbols",
    "create_domain",
    "rename_symbol",
    "compress_symbols",
    "refactor_symbols",
    "log_trace",
    "send_user_message",
    "trigger_agent",
    "set_system_prompt",
];

/// Authorization-scoped tool executor for one turn (or one MCP call).
pub struct ToolExecutor {
    state: AppState,
    /// The context session this executor runs inside, if any. Traces are
    /// tagged with it.
    session_id: Option<String>,
    /// False once the owning session is closed: reads only.
    session_writable: bool,
    auth: AuthContext,
}

impl ToolExecutor {
    pub fn new(
        state: AppState,
        session_id: Option<String>,
        session_writable: bool,
        auth: AuthContext,
    ) -> Self {
        Self {
            state,
            session_id,
            session_writable,
            auth,
        }
    }

    /// Run a tool call. Returns the serialized result and an error flag;
    /// never fails outright.
    ///
    /// Boxed because `dispatch` recurses back into `ToolExecutor::execute`
    /// (via `trigger_agent` → `execute_agent` → the turn loop), which would
    /// otherwise give this future an infinitely-recursive anonymous type
    /// and defeat `Send` inference for `tokio::spawn`.
    pub fn execute<'a>(
        &'a self,
        name: &'a str,
        args: &'a Value,
    ) -> Pin<Box<dyn Future<Output = (String, bool)> + Send + 'a>> {
        Box::pin(async move {
            match self.dispatch(name, args).await {
                Ok(value) => (value.to_string(), false),
                Err(e) => {
                    let payload = json!({ "error": e.to_string(), "code": error_code(&e) });
                    (payload.to_string(), true)
                }
            }
        })
    }

    fn dispatch<'a>(
        &'a self,
        name: &'a str,
        args: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move { self.dispatch_inner(name, args).await })
    }

    async fn dispatch_inner(&self, name: &str, args: &Value) -> Result<Value> {
        if WRITE_TOOLS.contains(&name) && !self.session_writable {
            return Err(Error::Conflict(
                "session is closed: write tools are unavailable".into(),
            ));
        }
        let auth = &self.auth;
        match name {
            // ── Registry reads ────────────────────────────────────
            "list_domains" => {
                let summaries = self.state.registry.get_metadata(auth).await?;
                Ok(serde_json::to_value(summaries)?)
            }
            "get_domain_symbols" => {
                let domain = require_str(args, "domain")?;
                let symbols = self.state.registry.get_symbols(domain, auth).await?;
                Ok(serde_json::to_value(symbols)?)
            }
            "find_symbol" => {
                let id = require_str(args, "id")?;
                let symbol = self.state.registry.find_by_id(id, auth).await?;
                Ok(serde_json::to_value(symbol)?)
            }
            "search_symbols" => {
                let query = require_str(args, "query")?;
                let opts = SearchOptions {
                    limit: args["limit"].as_u64().unwrap_or(10) as usize,
                    domains: args["domains"].as_array().map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    }),
                    ..Default::default()
                };
                let hits = self.state.registry.search(Some(query), auth, opts).await?;
                Ok(serde_json::to_value(hits)?)
            }
            "query_symbols" => {
                let domain = require_str(args, "domain")?;
                let page = self
                    .state
                    .registry
                    .query(
                        domain,
                        auth,
                        args["tag"].as_str(),
                        args["limit"].as_u64().unwrap_or(50) as usize,
                        args["last_id"].as_str(),
                    )
                    .await?;
                Ok(serde_json::to_value(page)?)
            }

            // ── Registry writes ───────────────────────────────────
            "upsert_symbols" => {
                let domain = require_str(args, "domain")?;
                let symbols: Vec<Symbol> = serde_json::from_value(args["symbols"].clone())
                    .map_err(|e| Error::InvalidRequest(format!("symbols: {e}")))?;
                let outcome = self
                    .state
                    .registry
                    .bulk_upsert(domain, symbols, false, auth)
                    .await?;
                Ok(serde_json::to_value(outcome)?)
            }
            "delete_symbols" => {
                let domain = require_str(args, "domain")?;
                let ids: Vec<String> = serde_json::from_value(args["ids"].clone())
                    .map_err(|e| Error::InvalidRequest(format!("ids: {e}")))?;
                let cascade = args["cascade"].as_bool().unwrap_or(false);
                let removed = self
                    .state
                    .registry
                    .delete_symbols(domain, &ids, cascade, auth)
                    .await?;
                Ok(json!({ "removed": removed }))
            }
            "create_domain" => {
                let id = require_str(args, "id")?;
                let name = args["name"].as_str().unwrap_or(id);
                let domain = self
                    .state
                    .registry
                    .create_domain(
                        id,
                        name,
                        args["description"].as_str().unwrap_or_default(),
                        vec![],
                        None,
                        auth,
                    )
                    .await?;
                Ok(serde_json::to_value(domain)?)
            }

            // ── Refactor ──────────────────────────────────────────
            "rename_symbol" => {
                let domain = require_str(args, "domain")?;
                let old_id = require_str(args, "old_id")?;
                let new_id = require_str(args, "new_id")?;
                let renamed = self
                    .state
                    .registry
                    .propagate_rename(domain, old_id, new_id, auth)
                    .await?;
                Ok(serde_json::to_value(renamed)?)
            }
            "compress_symbols" => {
                let new_symbol: Symbol = serde_json::from_value(args["new_symbol"].clone())
                    .map_err(|e| Error::InvalidRequest(format!("new_symbol: {e}")))?;
                let old_ids: Vec<String> = serde_json::from_value(args["old_ids"].clone())
                    .map_err(|e| Error::InvalidRequest(format!("old_ids: {e}")))?;
                let merged = self
                    .state
                    .registry
                    .compress_symbols(new_symbol, &old_ids, auth)
                    .await?;
                Ok(serde_json::to_value(merged)?)
            }
            "refactor_symbols" => {
                let updates: Vec<RefactorUpdate> = serde_json::from_value(args["updates"].clone())
                    .map_err(|e| Error::InvalidRequest(format!("updates: {e}")))?;
                let outcome = self
                    .state
                    .registry
                    .process_refactor_operation(updates, auth)
                    .await?;
                Ok(serde_json::to_value(outcome)?)
            }

            // ── Traces ────────────────────────────────────────────
            "log_trace" => {
                let mut trace: Trace = serde_json::from_value(args.clone())
                    .map_err(|e| Error::InvalidRequest(format!("trace: {e}")))?;
                trace.session_id = self.session_id.clone();
                let recorded = self.state.traces.record(trace).await?;
                Ok(json!({ "id": recorded.id, "status": "recorded" }))
            }

            // ── Sessions ──────────────────────────────────────────
            "send_user_message" => {
                let context_id = require_str(args, "context_id")?;
                let message = require_str(args, "message")?;
                let depth = self
                    .state
                    .contexts
                    .enqueue_message(context_id, message, "tool", auth)
                    .await?;
                self.state.kick_queue(context_id.to_owned());
                Ok(json!({ "queued": true, "depth": depth }))
            }

            // ── Agents ────────────────────────────────────────────
            "list_agents" => {
                let agents = self.state.agents.list().await?;
                Ok(serde_json::to_value(agents)?)
            }
            "trigger_agent" => {
                let id = require_str(args, "id")?;
                // Validate existence before handing off to the background.
                self.state.agents.get(id).await?;
                let state = self.state.clone();
                let agent_id = id.to_owned();
                let message = args["message"].as_str().map(String::from);
                tokio::spawn(async move {
                    if let Err(e) =
                        crate::runtime::agents::execute_agent(&state, &agent_id, message).await
                    {
                        tracing::warn!(agent_id = %agent_id, error = %e, "triggered agent failed");
                    }
                });
                Ok(json!({ "triggered": true }))
            }

            // ── Tests ─────────────────────────────────────────────
            "list_test_sets" => {
                let sets = self.state.tests.list_sets().await?;
                Ok(serde_json::to_value(sets)?)
            }

            // ── External ──────────────────────────────────────────
            "web_fetch" => {
                let url = require_str(args, "url")?;
                let body = web_fetch(url).await?;
                Ok(json!({ "url": url, "content": body }))
            }
            "web_search" => Err(Error::Unavailable(
                "web search is not configured; use search_symbols for registry lookups".into(),
            )),

            // ── Prompts ───────────────────────────────────────────
            "get_system_prompt" => Ok(json!({ "prompt": self.state.prompts.system_prompt() })),
            "set_system_prompt" => {
                if !auth.is_admin() {
                    return Err(Error::Forbidden("set_system_prompt requires admin".into()));
                }
                let prompt = require_str(args, "prompt")?;
                self.state.prompts.set_system_prompt(prompt).await?;
                Ok(json!({ "status": "updated" }))
            }

            _ => Err(Error::NotFound(format!("unknown tool {name}"))),
        }
    }
}

async fn web_fetch(url: &str) -> Result<String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(Error::InvalidRequest("url must be http(s)".into()));
    }
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(20))
        .build()
        .map_err(|e| Error::Http(e.to_string()))?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::Http(format!("HTTP {status} from {url}")));
    }
    let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
    // Keep tool results bounded.
    Ok(body.chars().take(8_192).collect())
}

fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str> {
    args[field]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidRequest(format!("missing field {field}")))
}

fn error_code(err: &Error) -> &'static str {
    match err {
        Error::Unauthorized => "unauthorized",
        Error::Forbidden(_) => "forbidden",
        Error::NotFound(_) => "not_found",
        Error::Conflict(_) => "conflict",
        Error::Busy(_) => "busy",
        Error::InvalidRequest(_) => "invalid_request",
        Error::InvalidSymbol { .. } => "invalid_symbol",
        Error::ReadOnlyDomain { .. } => "read_only_domain",
        Error::Unavailable(_) => "unavailable",
        _ => "internal",
    }
}

/// All tool declarations, in the shape the LLM adapters translate.
pub fn build_tool_definitions() -> Vec<ToolDefinition> {
    let mut defs = Vec::new();

    defs.push(ToolDefinition {
        name: "list_domains".into(),
        description: "List symbol domains visible to you, with symbol counts.".into(),
        parameters: json!({ "type": "object", "properties": {} }),
    });

    defs.push(ToolDefinition {
        name: "get_domain_symbols".into(),
        description: "Read every symbol in one domain.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "domain": { "type": "string", "description": "Domain id" }
            },
            "required": ["domain"]
        }),
    });

    defs.push(ToolDefinition {
        name: "find_symbol".into(),
        description: "Look up a single symbol by id.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Symbol id" }
            },
            "required": ["id"]
        }),
    });

    defs.push(ToolDefinition {
        name: "search_symbols".into(),
        description: "Semantic search over the symbol registry.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Max results (default 10)" },
                "domains": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Restrict to these domain ids"
                }
            },
            "required": ["query"]
        }),
    });

    defs.push(ToolDefinition {
        name: "query_symbols".into(),
        description: "Paginated scan of one domain, optionally filtered by tag.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "domain": { "type": "string" },
                "tag": { "type": "string" },
                "limit": { "type": "integer" },
                "last_id": { "type": "string", "description": "Cursor from the previous page" }
            },
            "required": ["domain"]
        }),
    });

    defs.push(ToolDefinition {
        name: "upsert_symbols".into(),
        description: "Create or update symbols in a domain. Symbols are validated.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "domain": { "type": "string" },
                "symbols": { "type": "array", "items": { "type": "object" } }
            },
            "required": ["domain", "symbols"]
        }),
    });

    defs.push(ToolDefinition {
        name: "delete_symbols".into(),
        description: "Delete symbols from a domain. With cascade, references to them are removed everywhere.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "domain": { "type": "string" },
                "ids": { "type": "array", "items": { "type": "string" } },
                "cascade": { "type": "boolean" }
            },
            "required": ["domain", "ids"]
        }),
    });

    defs.push(ToolDefinition {
        name: "create_domain".into(),
        description: "Create a new symbol domain.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "name": { "type": "string" },
                "description": { "type": "string" }
            },
            "required": ["id"]
        }),
    });

    defs.push(ToolDefinition {
        name: "rename_symbol".into(),
        description: "Rename a symbol, rewriting every reference to it across domains.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "domain": { "type": "string" },
                "old_id": { "type": "string" },
                "new_id": { "type": "string" }
            },
            "required": ["domain", "old_id", "new_id"]
        }),
    });

    defs.push(ToolDefinition {
        name: "compress_symbols".into(),
        description: "Merge several symbols into one new symbol, rewriting all references.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "new_symbol": { "type": "object" },
                "old_ids": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["new_symbol", "old_ids"]
        }),
    });

    defs.push(ToolDefinition {
        name: "refactor_symbols".into(),
        description: "Apply a batch of upsert/rename/delete refactor steps in order.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "updates": { "type": "array", "items": { "type": "object" } }
            },
            "required": ["updates"]
        }),
    });

    defs.push(ToolDefinition {
        name: "log_trace".into(),
        description: "Record a symbolic reasoning chain: entry node, activation path, output node.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "entry_node": { "type": "string" },
                "activated_by": { "type": "string" },
                "activation_path": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "symbol_id": { "type": "string" },
                            "reason": { "type": "string" },
                            "link_type": { "type": "string" }
                        },
                        "required": ["symbol_id"]
                    }
                },
                "source_context": { "type": "object" },
                "output_node": { "type": "string" },
                "status": { "type": "string" }
            },
            "required": ["entry_node", "output_node"]
        }),
    });

    defs.push(ToolDefinition {
        name: "send_user_message".into(),
        description: "Queue a message into another context session.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "context_id": { "type": "string" },
                "message": { "type": "string" }
            },
            "required": ["context_id", "message"]
        }),
    });

    defs.push(ToolDefinition {
        name: "list_agents".into(),
        description: "List scheduled agents.".into(),
        parameters: json!({ "type": "object", "properties": {} }),
    });

    defs.push(ToolDefinition {
        name: "trigger_agent".into(),
        description: "Run a scheduled agent now, optionally with an override message.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "message": { "type": "string" }
            },
            "required": ["id"]
        }),
    });

    defs.push(ToolDefinition {
        name: "list_test_sets".into(),
        description: "List activation test sets.".into(),
        parameters: json!({ "type": "object", "properties": {} }),
    });

    defs.push(ToolDefinition {
        name: "web_fetch".into(),
        description: "Fetch a URL and return its body text (truncated).".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" }
            },
            "required": ["url"]
        }),
    });

    defs.push(ToolDefinition {
        name: "web_search".into(),
        description: "Search the web. Currently unavailable — returns an error with alternatives.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" }
            },
            "required": ["query"]
        }),
    });

    defs.push(ToolDefinition {
        name: "get_system_prompt".into(),
        description: "Read the active activation prompt.".into(),
        parameters: json!({ "type": "object", "properties": {} }),
    });

    defs.push(ToolDefinition {
        name: "set_system_prompt".into(),
        description: "Replace the active activation prompt (admin only).".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string" }
            },
            "required": ["prompt"]
        }),
    });

    defs
}

/// The declarations exposed over MCP: restricted tools are always hidden,
/// admin tools only shown to admins.
pub fn mcp_tool_definitions(is_admin: bool) -> Vec<ToolDefinition> {
    build_tool_definitions()
        .into_iter()
        .filter(|def| !RESTRICTED_TOOLS.contains(&def.name.as_str()))
        .filter(|def| is_admin || !ADMIN_TOOLS.contains(&def.name.as_str()))
        .collect()
}

/// Why an MCP call to `name` is denied, if it is.
pub fn mcp_denial(name: &str, is_admin: bool) -> Option<String> {
    if RESTRICTED_TOOLS.contains(&name) {
        return Some(format!("tool {name} is not available over this channel"));
    }
    if !is_admin && ADMIN_TOOLS.contains(&name) {
        return Some(format!("tool {name} requires admin privileges"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_restricted_tool_is_declared() {
        let names: Vec<String> = build_tool_definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        for tool in RESTRICTED_TOOLS.iter().chain(ADMIN_TOOLS) {
            assert!(names.iter().any(|n| n == tool), "{tool} not declared");
        }
    }

    #[test]
    fn mcp_filtering_hides_restricted_and_admin_tools() {
        let user_tools = mcp_tool_definitions(false);
        assert!(user_tools.iter().all(|d| d.name != "upsert_symbols"));
        assert!(user_tools.iter().all(|d| d.name != "send_user_message"));
        assert!(user_tools.iter().any(|d| d.name == "search_symbols"));

        let admin_tools = mcp_tool_definitions(true);
        assert!(admin_tools.iter().any(|d| d.name == "upsert_symbols"));
        // Restricted stays hidden even for admins.
        assert!(admin_tools.iter().all(|d| d.name != "send_user_message"));
    }

    #[test]
    fn denial_messages() {
        assert!(mcp_denial("web_fetch", true).is_some());
        assert!(mcp_denial("upsert_symbols", false)
            .unwrap()
            .contains("admin"));
        assert!(mcp_denial("upsert_symbols", true).is_none());
        assert!(mcp_denial("search_symbols", false).is_none());
    }

    #[test]
    fn tool_schemas_are_objects() {
        for def in build_tool_definitions() {
            assert_eq!(def.parameters["type"], "object", "{}", def.name);
        }
    }
}
