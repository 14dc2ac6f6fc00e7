//! Kernel configuration, loaded from `signalzero.toml` with serde
//! defaults so a missing file still boots a usable dev instance.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. `["*"]` allows all (dev only).
    #[serde(default = "default_origins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for the persisted store image. Empty = memory only.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Bounded startup retries before serving degraded.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_flush_secs")]
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub roles: RoleMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub kind: BackendKind,
    pub base_url: String,
    /// Env var holding the API key (keys never live in the file).
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    OpenaiCompat,
    Anthropic,
}

/// Backend ids bound to the three kernel roles.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoleMap {
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub baseline: Option<String>,
    #[serde(default)]
    pub judge: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum model ↔ tool round-trips per turn.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// LLM transport retry attempts per step.
    #[serde(default = "default_retries")]
    pub llm_retry_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Env var compared (constant-time) against `x-internal-key`.
    #[serde(default = "default_internal_key_env")]
    pub internal_key_env: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_mcp_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8717
}
fn default_origins() -> Vec<String> {
    vec!["http://localhost:*".into()]
}
fn default_store_path() -> String {
    "./data".into()
}
fn default_connect_retries() -> u32 {
    5
}
fn default_flush_secs() -> u64 {
    30
}
fn default_max_steps() -> u32 {
    16
}
fn default_retries() -> u32 {
    3
}
fn default_tick_secs() -> u64 {
    1
}
fn default_internal_key_env() -> String {
    "SZ_INTERNAL_KEY".into()
}
fn default_token_ttl_hours() -> u64 {
    72
}
fn default_mcp_session_ttl() -> u64 {
    3_600
}
fn default_keep_alive_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_origins(),
        }
    }
}
impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            connect_retries: default_connect_retries(),
            flush_interval_secs: default_flush_secs(),
        }
    }
}
impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            llm_retry_attempts: default_retries(),
        }
    }
}
impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}
impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            internal_key_env: default_internal_key_env(),
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}
impl Default for McpConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_mcp_session_ttl(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Parse a TOML string.
    pub fn from_toml(raw: &str) -> crate::Result<Self> {
        toml::from_str(raw).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Sanity checks. Errors are fatal at startup; warnings are logged.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.runtime.max_steps == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "runtime.max_steps must be at least 1".into(),
            });
        }
        if self.scheduler.tick_secs == 0 || self.scheduler.tick_secs > 1 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "scheduler.tick_secs outside the supported 1s tick".into(),
            });
        }
        if self.llm.backends.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "no LLM backends configured — chat turns will fail".into(),
            });
        }
        for role in [
            ("primary", &self.llm.roles.primary),
            ("baseline", &self.llm.roles.baseline),
            ("judge", &self.llm.roles.judge),
        ] {
            if let Some(id) = role.1 {
                if !self.llm.backends.iter().any(|b| &b.id == id) {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        message: format!("llm.roles.{} references unknown backend {id}", role.0),
                    });
                }
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_boot_without_a_file() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8717);
        assert_eq!(cfg.runtime.max_steps, 16);
        assert_eq!(cfg.scheduler.tick_secs, 1);
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg = Config::from_toml(
            r#"
            [server]
            port = 9000

            [[llm.backends]]
            id = "main"
            kind = "openai_compat"
            base_url = "http://localhost:11434/v1"

            [llm.roles]
            primary = "main"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.llm.backends.len(), 1);
        assert_eq!(cfg.llm.roles.primary.as_deref(), Some("main"));
        assert!(cfg
            .validate()
            .iter()
            .all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn unknown_role_backend_is_fatal() {
        let mut cfg = Config::default();
        cfg.llm.roles.primary = Some("ghost".into());
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("ghost")));
    }
}
