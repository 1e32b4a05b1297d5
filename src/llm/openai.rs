//! OpenAI-compatible backend adapter (chat completions protocol).
//!
//! Covers OpenAI itself and compatible services (DeepSeek, vLLM, etc.) via
//! the configured base URL. Reasoning output is read from the
//! `reasoning_content` field that compatible servers emit.

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

/// Connection settings for one OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub capabilities: Capabilities,
    pub timeout: Duration,
}

/// OpenAI-compatible API provider.
pub struct OpenAiProvider {
    name: String,
    client: Client,
    settings: OpenAiSettings,
}

impl OpenAiProvider {
    /// Create a new provider with the given registry name.
    pub fn new(name: impl Into<String>, settings: OpenAiSettings) -> Self {
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
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    fn build_messages(&self, request: &CompletionRequest) -> Vec<OpenAiMessage> {
        let mut out = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            out.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(OpenAiContent::Text(system.clone())),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        for msg in &request.messages {
            out.push(convert_message(msg));
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

fn convert_message(msg: &ChatMessage) -> OpenAiMessage {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let content = if msg.images.is_empty() {
        Some(OpenAiContent::Text(msg.content.clone()))
    } else {
        // Vision input uses the multipart content form with data URIs
        let mut parts = vec![OpenAiContentPart::Text {
            text: msg.content.clone(),
        }];
        for image in &msg.images {
            parts.push(OpenAiContentPart::ImageUrl {
                image_url: OpenAiImageUrl {
                    url: format!("data:{};base64,{}", image.media_type, image.data),
                },
            });
        }
        Some(OpenAiContent::Parts(parts))
    };

    let tool_calls = if msg.tool_calls.is_empty() {
        None
    } else {
        Some(
            msg.tool_calls
                .iter()
                .map(|tc| OpenAiToolCall {
                    id: tc.id.clone(),
                    call_type: "function".to_string(),
                    function: OpenAiToolCallFunction {
                        name: tc.name.clone(),
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect(),
        )
    };

    OpenAiMessage {
        role: role.to_string(),
        content,
        tool_calls,
        tool_call_id: msg.tool_call_id.clone(),
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiToolDef>>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Serialize)]
struct OpenAiImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct OpenAiToolDef {
    #[serde(rename = "type")]
    def_type: String,
    function: OpenAiFunctionDef,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModelEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelEntry {
    id: String,
}

fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolUse,
        _ => FinishReason::Unknown,
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.settings.capabilities
    }

    fn cost_per_token(&self, model: &str) -> (Decimal, Decimal) {
        // Per-token pricing for common tiers; unknown models fall back to the
        // mid tier.
        match model {
            m if m.contains("gpt-4o-mini") => (dec!(0.00000015), dec!(0.0000006)),
            m if m.contains("gpt-4o") => (dec!(0.0000025), dec!(0.00001)),
            m if m.contains("deepseek") => (dec!(0.00000027), dec!(0.0000011)),
            _ => (dec!(0.0000025), dec!(0.00001)),
        }
    }

    async fn complete(
        &self,
        model: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let tools: Option<Vec<OpenAiToolDef>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAiToolDef {
                        def_type: "function".to_string(),
                        function: OpenAiFunctionDef {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        let body = OpenAiRequest {
            model: model.to_string(),
            messages: self.build_messages(&request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
        };

        let response = self
            .auth(
                self.client
                    .post(format!("{}/v1/chat/completions", self.settings.base_url)),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let reason = match response.json::<OpenAiErrorBody>().await {
                Ok(body) => body.error.message,
                Err(_) => format!("HTTP {}", status.as_u16()),
            };
            return Err(LlmError::Protocol {
                provider: self.name.clone(),
                reason: format!("HTTP {}: {}", status.as_u16(), reason),
            });
        }

        let parsed: OpenAiResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::Protocol {
                    provider: self.name.clone(),
                    reason: format!("failed to decode response: {}", e),
                })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol {
                provider: self.name.clone(),
                reason: "response contained no choices".to_string(),
            })?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| {
                let arguments = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::Null);
                ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments,
                }
            })
            .collect();

        let usage = parsed.usage.unwrap_or(OpenAiUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
            tool_calls,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self
            .auth(self.client.get(format!("{}/v1/models", self.settings.base_url)))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Err(LlmError::Protocol {
                provider: self.name.clone(),
                reason: format!("HTTP {} from /v1/models", response.status().as_u16()),
            });
        }

        let parsed: OpenAiModelList =
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
