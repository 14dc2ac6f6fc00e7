use serde::{Deserialize, Serialize};

use sz_domain::error::Result;
use sz_domain::tool::{Message, ToolCall, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A backend-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature. `None` lets the backend choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the backend choose.
    pub max_tokens: Option<u32>,
    /// When true, request the model to respond with valid JSON only.
    pub json_mode: bool,
    /// Model identifier override. `None` uses the backend default.
    pub model: Option<String>,
}

/// Token usage reported by a backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A backend-agnostic chat completion response: a final text, tool calls,
/// or both.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    /// A response with no tool calls is a final turn.
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core backend trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The capability every LLM adapter must implement.
///
/// Implementations translate between the kernel's internal types and a
/// backend's wire format. `embed` may be unsupported (the Anthropic
/// adapter returns `Unavailable`); callers that need vectors must be
/// wired to a backend that provides them.
#[async_trait::async_trait]
pub trait LlmBackend: Send + Sync {
    /// Send a chat request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// Embed a single text into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// A unique identifier for this backend instance.
    fn backend_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_finality() {
        let resp = ChatResponse {
            content: "done".into(),
            tool_calls: vec![],
            usage: None,
            model: "m".into(),
            finish_reason: Some("stop".into()),
        };
        assert!(resp.is_final());
    }
}
