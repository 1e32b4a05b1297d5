//! Ollama backend adapter (native `/api/chat` protocol).
//!
//! Also speaks to Ollama-compatible servers behind an optional API key.
//! The `think` flag and `num_ctx` option are passed through when configured.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{
    Capabilities, ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    Role, ToolCall,
};

/// Connection settings for one Ollama backend.
#[derive(Debug, Clone)]
pub struct OllamaSettings {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub capabilities: Capabilities,
    /// Context length sent as the `num_ctx` option. `None` = server default.
    pub num_ctx: Option<u32>,
    pub timeout: Duration,
}

/// Ollama API provider.
pub struct OllamaProvider {
    name: String,
    client: Client,
    settings: OllamaSettings,
}

impl OllamaProvider {
    /// Create a new Ollama provider with the given registry name.
    pub fn new(name: impl Into<String>, settings: OllamaSettings) -> Self {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            name: name.into(),
            client,
            settings,
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.api_key {
            Some(key) => builder.header(
                "Authorization",
                format!("Bearer {}", key.expose_secret()),
            ),
            None => builder,
        }
    }

    fn build_messages(&self, request: &CompletionRequest) -> Vec<OllamaMessage> {
        let mut out = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            out.push(OllamaMessage {
                role: "system".to_string(),
                content: system.clone(),
                images: None,
                tool_calls: None,
                tool_name: None,
            });
        }
        for msg in &request.messages {
            out.push(OllamaMessage::from(msg));
        }
        out
    }

    fn map_error(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout {
                provider: self.name.clone(),
                seconds: self.settings.timeout.as_secs(),
            }
        } else {
            LlmError::Http(err)
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OllamaTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

impl From<&ChatMessage> for OllamaMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let images = if msg.images.is_empty() {
            None
        } else {
            // Ollama takes bare base64 strings, no data-URI wrapper
            Some(msg.images.iter().map(|i| i.data.clone()).collect())
        };
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "function": { "name": tc.name, "arguments": tc.arguments }
                        })
                    })
                    .collect(),
            )
        };
        Self {
            role: role.to_string(),
            content: msg.content.clone(),
            images,
            tool_calls,
            tool_name: msg.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OllamaFunction,
}

#[derive(Debug, Serialize)]
struct OllamaFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaToolCallFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    name: String,
}

fn parse_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    if has_tool_calls {
        return FinishReason::ToolUse;
    }
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Unknown,
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.settings.capabilities
    }

    fn cost_per_token(&self, _model: &str) -> (Decimal, Decimal) {
        // Local inference: no per-token cost
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(
        &self,
        model: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let tools: Option<Vec<OllamaTool>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OllamaTool {
                        tool_type: "function".to_string(),
                        function: OllamaFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        let mut options = serde_json::Map::new();
        if let Some(num_ctx) = self.settings.num_ctx {
            options.insert("num_ctx".to_string(), num_ctx.into());
        }
        if let Some(temperature) = request.temperature {
            options.insert("temperature".to_string(), serde_json::json!(temperature));
        }

        let body = OllamaRequest {
            model: model.to_string(),
            messages: self.build_messages(&request),
            stream: false,
            think: request.reasoning,
            tools,
            options: if options.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(options))
            },
        };

        let response = self
            .auth(
                self.client
                    .post(format!("{}/api/chat", self.settings.base_url)),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Protocol {
                provider: self.name.clone(),
                reason: format!("HTTP {}: {}", status.as_u16(), truncate(&text, 300)),
            });
        }

        let parsed: OllamaResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::Protocol {
                    provider: self.name.clone(),
                    reason: format!("failed to decode response: {}", e),
                })?;

        let tool_calls: Vec<ToolCall> = parsed
            .message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, tc)| ToolCall {
                // Ollama does not assign call ids; synthesize stable ones
                id: format!("call-{}", i),
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        let finish_reason =
            parse_finish_reason(parsed.done_reason.as_deref(), !tool_calls.is_empty());

        Ok(CompletionResponse {
            content: parsed.message.content,
            reasoning: parsed.message.thinking.filter(|t| !t.is_empty()),
            tool_calls,
            input_tokens: parsed.prompt_eval_count.unwrap_or(0),
            output_tokens: parsed.eval_count.unwrap_or(0),
            finish_reason,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self
            .auth(
                self.client
                    .get(format!("{}/api/tags", self.settings.base_url)),
            )
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Err(LlmError::Protocol {
                provider: self.name.clone(),
                reason: format!("HTTP {} from /api/tags", response.status().as_u16()),
            });
        }

        let parsed: OllamaTagsResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::Protocol {
                    provider: self.name.clone(),
                    reason: format!("failed to decode tag list: {}", e),
                })?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ImageData;

    fn settings() -> OllamaSettings {
        OllamaSettings {
            base_url: "http://127.0.0.1:11434".to_string(),
            api_key: None,
            capabilities: Capabilities {
                tools: true,
                reasoning: true,
                vision: false,
            },
            num_ctx: Some(8192),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_message_conversion_includes_images() {
        let msg = ChatMessage::user("what is this?").with_images(vec![ImageData {
            data: "aGVsbG8=".to_string(),
            media_type: "image/png".to_string(),
        }]);
        let converted = OllamaMessage::from(&msg);
        assert_eq!(converted.role, "user");
        assert_eq!(converted.images.as_ref().unwrap().len(), 1);
        assert_eq!(converted.images.unwrap()[0], "aGVsbG8=");
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(parse_finish_reason(Some("stop"), false), FinishReason::Stop);
        assert_eq!(
            parse_finish_reason(Some("length"), false),
            FinishReason::Length
        );
        assert_eq!(parse_finish_reason(Some("stop"), true), FinishReason::ToolUse);
        assert_eq!(parse_finish_reason(None, false), FinishReason::Unknown);
    }

    #[test]
    fn test_local_inference_is_free() {
        let provider = OllamaProvider::new("local", settings());
        assert_eq!(
            provider.cost_per_token("qwen3:14b"),
            (Decimal::ZERO, Decimal::ZERO)
        );
    }

    #[test]
    fn test_request_serialization_skips_empty_fields() {
        let body = OllamaRequest {
            model: "qwen3:14b".to_string(),
            messages: vec![],
            stream: false,
            think: None,
            tools: None,
            options: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("think").is_none());
        assert!(json.get("tools").is_none());
        assert!(json.get("options").is_none());
    }
}
