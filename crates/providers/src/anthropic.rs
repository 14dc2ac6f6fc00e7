//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use and the
//! Anthropic-specific message structure where system messages go in a
//! separate top-level `system` field. Anthropic has no embeddings
//! endpoint, so `embed` returns `Unavailable`.

use serde_json::Value;

use sz_domain::config::BackendConfig;
use sz_domain::error::{Error, Result};
use sz_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};

use crate::traits::{ChatRequest, ChatResponse, LlmBackend, Usage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// An LLM backend adapter for the Anthropic Messages API.
pub struct AnthropicBackend {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn from_config(cfg: &BackendConfig) -> Result<Self> {
        let api_key = if cfg.api_key_env.is_empty() {
            String::new()
        } else {
            std::env::var(&cfg.api_key_env).unwrap_or_default()
        };
        if api_key.is_empty() {
            return Err(Error::Config(format!(
                "backend {}: {} is unset or empty",
                cfg.id, cfg.api_key_env
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg
                .default_model
                .clone()
                .unwrap_or_else(|| "claude-sonnet-4-20250514".into()),
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &ChatRequest) -> Value {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        // System messages live in a separate top-level field.
        let mut system_parts: Vec<String> = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.extract_all_text()),
                Role::User => api_messages.push(serde_json::json!({
                    "role": "user",
                    "content": msg.content.extract_all_text(),
                })),
                Role::Assistant => api_messages.push(assistant_msg_to_anthropic(msg)),
                // Tool results travel as user messages with tool_result blocks.
                Role::Tool => api_messages.push(tool_result_to_anthropic(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "max_tokens": req.max_tokens.unwrap_or(4096),
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body
    }
}

fn assistant_msg_to_anthropic(msg: &Message) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Text(t) => vec![serde_json::json!({ "type": "text", "text": t })],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => {
                    Some(serde_json::json!({ "type": "text", "text": text }))
                }
                ContentPart::ToolUse { id, name, input } => Some(serde_json::json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                })),
                _ => None,
            })
            .collect(),
    };
    serde_json::json!({ "role": "assistant", "content": content })
}

fn tool_result_to_anthropic(msg: &Message) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![serde_json::json!({
            "type": "tool_result",
            "tool_use_id": "",
            "content": t,
        })],
    };
    serde_json::json!({ "role": "user", "content": content })
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

fn parse_messages_response(body: &Value) -> Result<ChatResponse> {
    let content_blocks = body["content"].as_array().ok_or_else(|| Error::Backend {
        backend: "anthropic".into(),
        message: "response has no content".into(),
    })?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content_blocks {
        match block["type"].as_str() {
            Some("text") => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(block["text"].as_str().unwrap_or_default());
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                call_id: block["id"].as_str().unwrap_or_default().to_string(),
                tool_name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    let usage = body.get("usage").map(|u| {
        let prompt = u["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion = u["output_tokens"].as_u64().unwrap_or(0) as u32;
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    });

    Ok(ChatResponse {
        content: text,
        tool_calls,
        usage,
        model: body["model"].as_str().unwrap_or_default().to_string(),
        finish_reason: body["stop_reason"].as_str().map(String::from),
    })
}

#[async_trait::async_trait]
impl LlmBackend for AnthropicBackend {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req);

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let json: Value = resp.json().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Backend {
                backend: self.id.clone(),
                message: format!(
                    "HTTP {status}: {}",
                    json["error"]["message"].as_str().unwrap_or("unknown")
                ),
            });
        }
        parse_messages_response(&json)
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::Unavailable(format!(
            "backend {} does not provide embeddings",
            self.id
        )))
    }

    fn backend_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_move_to_top_level() {
        std::env::set_var("SZ_TEST_ANTHROPIC_KEY", "k");
        let backend = AnthropicBackend::from_config(&BackendConfig {
            id: "a".into(),
            kind: sz_domain::config::BackendKind::Anthropic,
            base_url: "https://api.anthropic.com".into(),
            api_key_env: "SZ_TEST_ANTHROPIC_KEY".into(),
            default_model: None,
            embedding_model: None,
        })
        .unwrap();

        let req = ChatRequest {
            messages: vec![Message::system("base prompt"), Message::user("hi")],
            ..Default::default()
        };
        let body = backend.build_messages_body(&req);
        assert_eq!(body["system"], "base prompt");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn parses_tool_use_blocks() {
        let body = serde_json::json!({
            "model": "claude",
            "stop_reason": "tool_use",
            "content": [
                { "type": "text", "text": "activating" },
                { "type": "tool_use", "id": "tu_1", "name": "log_trace", "input": { "entry_node": "a" } }
            ],
            "usage": { "input_tokens": 7, "output_tokens": 3 }
        });
        let resp = parse_messages_response(&body).unwrap();
        assert_eq!(resp.content, "activating");
        assert_eq!(resp.tool_calls[0].tool_name, "log_trace");
        assert_eq!(resp.usage.unwrap().total_tokens, 10);
    }

    #[test]
    fn tool_results_become_user_messages() {
        let msg = Message::tool_result("tu_1", "ok");
        let json = tool_result_to_anthropic(&msg);
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "tu_1");
    }
}
