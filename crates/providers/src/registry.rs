//! Backend registry.
//!
//! Constructs every configured backend at startup and binds instances to
//! the three kernel roles: **primary** (chat turns, embeddings),
//! **baseline** (no-tools comparison runs) and **judge** (comparison
//! scoring). Backends that fail to initialize are logged and skipped so
//! the kernel can boot degraded.

use std::collections::HashMap;
use std::sync::Arc;

use sz_domain::config::{BackendKind, LlmConfig};
use sz_domain::error::{Error, Result};

use crate::anthropic::AnthropicBackend;
use crate::openai_compat::OpenAiCompatBackend;
use crate::traits::LlmBackend;

/// Records a backend that failed to initialize.
#[derive(Debug, Clone)]
pub struct BackendInitError {
    pub backend_id: String,
    pub error: String,
}

pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn LlmBackend>>,
    primary: Option<String>,
    baseline: Option<String>,
    judge: Option<String>,
    init_errors: Vec<BackendInitError>,
}

impl BackendRegistry {
    /// Build the registry from config. Env-var API keys are read here.
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut backends: HashMap<String, Arc<dyn LlmBackend>> = HashMap::new();
        let mut init_errors = Vec::new();

        for cfg in &config.backends {
            let result: Result<Arc<dyn LlmBackend>> = match cfg.kind {
                BackendKind::OpenaiCompat => OpenAiCompatBackend::from_config(cfg)
                    .map(|b| Arc::new(b) as Arc<dyn LlmBackend>),
                BackendKind::Anthropic => AnthropicBackend::from_config(cfg)
                    .map(|b| Arc::new(b) as Arc<dyn LlmBackend>),
            };
            match result {
                Ok(backend) => {
                    tracing::info!(backend_id = %cfg.id, kind = ?cfg.kind, "registered LLM backend");
                    backends.insert(cfg.id.clone(), backend);
                }
                Err(e) => {
                    tracing::warn!(backend_id = %cfg.id, error = %e, "failed to initialize LLM backend, skipping");
                    init_errors.push(BackendInitError {
                        backend_id: cfg.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Self {
            backends,
            primary: config.roles.primary.clone(),
            baseline: config.roles.baseline.clone(),
            judge: config.roles.judge.clone(),
            init_errors,
        }
    }

    /// Registry with a single backend bound to every role (tests).
    pub fn single(backend: Arc<dyn LlmBackend>) -> Self {
        let id = backend.backend_id().to_string();
        let mut backends = HashMap::new();
        backends.insert(id.clone(), backend);
        Self {
            backends,
            primary: Some(id.clone()),
            baseline: Some(id.clone()),
            judge: Some(id),
            init_errors: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn init_errors(&self) -> &[BackendInitError] {
        &self.init_errors
    }

    fn resolve(&self, role_name: &str, id: Option<&String>) -> Result<Arc<dyn LlmBackend>> {
        if let Some(id) = id {
            return self
                .backends
                .get(id)
                .cloned()
                .ok_or_else(|| Error::Unavailable(format!("{role_name} backend {id} not available")));
        }
        // No explicit binding: fall back to any registered backend.
        self.backends
            .values()
            .next()
            .cloned()
            .ok_or_else(|| Error::Unavailable("no LLM backends configured".into()))
    }

    /// The backend used for chat turns and embeddings.
    pub fn primary(&self) -> Result<Arc<dyn LlmBackend>> {
        self.resolve("primary", self.primary.as_ref())
    }

    /// The no-tools comparison backend. Falls back to primary.
    pub fn baseline(&self) -> Result<Arc<dyn LlmBackend>> {
        self.resolve("baseline", self.baseline.as_ref().or(self.primary.as_ref()))
    }

    /// The comparison-scoring backend. Falls back to primary.
    pub fn judge(&self) -> Result<Arc<dyn LlmBackend>> {
        self.resolve("judge", self.judge.as_ref().or(self.primary.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChatRequest, ChatResponse};

    struct FakeBackend(String);

    #[async_trait::async_trait]
    impl LlmBackend for FakeBackend {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: "ok".into(),
                tool_calls: vec![],
                usage: None,
                model: self.0.clone(),
                finish_reason: None,
            })
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0])
        }
        fn backend_id(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn single_binds_all_roles() {
        let reg = BackendRegistry::single(Arc::new(FakeBackend("fake".into())));
        assert_eq!(reg.primary().unwrap().backend_id(), "fake");
        assert_eq!(reg.baseline().unwrap().backend_id(), "fake");
        assert_eq!(reg.judge().unwrap().backend_id(), "fake");
    }

    #[test]
    fn empty_registry_reports_unavailable() {
        let reg = BackendRegistry::from_config(&LlmConfig::default());
        assert!(reg.is_empty());
        assert!(matches!(reg.primary(), Err(Error::Unavailable(_))));
    }
}
