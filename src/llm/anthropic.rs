//! Anthropic backend adapter (Messages API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{
    Capabilities, ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    Role, ToolCall,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Connection settings for one Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicSettings {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub capabilities: Capabilities,
    pub timeout: Duration,
}

/// Anthropic API provider.
pub struct AnthropicProvider {
    name: String,
    client: Client,
    settings: AnthropicSettings,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with the given registry name.
    pub fn new(name: impl Into<String>, settings: AnthropicSettings) -> Self {
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

    fn headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        match &self.settings.api_key {
            Some(key) => builder.header("x-api-key", key.expose_secret()),
            None => builder,
        }
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

fn convert_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            // A leading system turn is handled by the caller; any inline
            // system turn (e.g. a compaction summary) is folded into a user
            // turn since the Messages API has no system role
            Role::System => out.push(AnthropicMessage {
                role: "user".to_string(),
                content: AnthropicContent::Blocks(vec![AnthropicContentBlock::Text {
                    text: msg.content.clone(),
                }]),
            }),
            Role::User => {
                let mut blocks = Vec::new();
                for image in &msg.images {
                    blocks.push(AnthropicContentBlock::Image {
                        source: AnthropicImageSource {
                            source_type: "base64".to_string(),
                            media_type: image.media_type.clone(),
                            data: image.data.clone(),
                        },
                    });
                }
                blocks.push(AnthropicContentBlock::Text {
                    text: msg.content.clone(),
                });
                out.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: AnthropicContent::Blocks(blocks),
                });
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(AnthropicContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                for tc in &msg.tool_calls {
                    blocks.push(AnthropicContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: tc.arguments.clone(),
                    });
                }
                if blocks.is_empty() {
                    blocks.push(AnthropicContentBlock::Text {
                        text: String::new(),
                    });
                }
                out.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: AnthropicContent::Blocks(blocks),
                });
            }
            Role::Tool => out.push(AnthropicMessage {
                role: "user".to_string(),
                content: AnthropicContent::Blocks(vec![AnthropicContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone(),
                }]),
            }),
        }
    }
    out
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<AnthropicThinking>,
}

#[derive(Debug, Serialize)]
struct AnthropicThinking {
    #[serde(rename = "type")]
    thinking_type: String,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicModelList {
    #[serde(default)]
    data: Vec<AnthropicModelEntry>,
}

#[derive(Debug, Deserialize)]
struct AnthropicModelEntry {
    id: String,
}

fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        _ => FinishReason::Unknown,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.settings.capabilities
    }

    fn cost_per_token(&self, model: &str) -> (Decimal, Decimal) {
        match model {
            m if m.contains("opus") => (dec!(0.000015), dec!(0.000075)),
            m if m.contains("haiku") => (dec!(0.0000008), dec!(0.000004)),
            _ => (dec!(0.000003), dec!(0.000015)),
        }
    }

    async fn complete(
        &self,
        model: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let tools: Option<Vec<AnthropicTool>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| AnthropicTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.parameters.clone(),
                    })
                    .collect(),
            )
        };

        let thinking = match request.reasoning {
            Some(true) => Some(AnthropicThinking {
                thinking_type: "enabled".to_string(),
                budget_tokens: 4096,
            }),
            _ => None,
        };

        let body = AnthropicRequest {
            model: model.to_string(),
            messages: convert_messages(&request.messages),
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system.clone(),
            temperature: request.temperature,
            tools,
            thinking,
        };

        let response = self
            .headers(
                self.client
                    .post(format!("{}/v1/messages", self.settings.base_url)),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let reason = match response.json::<AnthropicErrorBody>().await {
                Ok(body) => body.error.message,
                Err(_) => format!("HTTP {}", status.as_u16()),
            };
            return Err(LlmError::Protocol {
                provider: self.name.clone(),
                reason: format!("HTTP {}: {}", status.as_u16(), reason),
            });
        }

        let parsed: AnthropicResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::Protocol {
                    provider: self.name.clone(),
                    reason: format!("failed to decode response: {}", e),
                })?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();

        for block in parsed.content {
            match block {
                AnthropicContentBlock::Text { text } => {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&text);
                }
                AnthropicContentBlock::Thinking { thinking, .. } => {
                    reasoning.push_str(&thinking);
                }
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input,
                    });
                }
                _ => {}
            }
        }

        Ok(CompletionResponse {
            content,
            reasoning: if reasoning.is_empty() {
                None
            } else {
                Some(reasoning)
            },
            tool_calls,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            finish_reason: parse_finish_reason(parsed.stop_reason.as_deref()),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self
            .headers(self.client.get(format!("{}/v1/models", self.settings.base_url)))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Err(LlmError::Protocol {
                provider: self.name.clone(),
                reason: format!("HTTP {} from /v1/models", response.status().as_u16()),
            });
        }

        let parsed: AnthropicModelList =
            response
                .json()
                .await
                .map_err(|e| LlmError::Protocol {
                    provider: self.name.clone(),
                    reason: format!("failed to decode model list: {}", e),
                })?;

        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_becomes_user_block() {
        let messages = vec![ChatMessage::tool("toolu_01", "42 degrees")];
        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
        let json = serde_json::to_value(&converted[0]).unwrap();
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "toolu_01");
    }

    #[test]
    fn test_inline_system_turn_folded_into_user() {
        let messages = vec![
            ChatMessage::system("[Summary of the conversation so far]\nfacts"),
            ChatMessage::user("continue"),
        ];
        let converted = convert_messages(&messages);
        assert_eq!(converted[0].role, "user");
        assert_eq!(converted[1].role, "user");
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(parse_finish_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(parse_finish_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(parse_finish_reason(Some("tool_use")), FinishReason::ToolUse);
        assert_eq!(parse_finish_reason(Some("weird")), FinishReason::Unknown);
    }

    #[test]
    fn test_opus_pricing_above_haiku() {
        let provider = AnthropicProvider::new(
            "anthropic",
            AnthropicSettings {
                base_url: "https://api.anthropic.com".to_string(),
                api_key: None,
                capabilities: Capabilities::default(),
                timeout: Duration::from_secs(30),
            },
        );
        let (opus_in, _) = provider.cost_per_token("claude-opus-4");
        let (haiku_in, _) = provider.cost_per_token("claude-haiku-4");
        assert!(opus_in > haiku_in);
    }
}
