//! Normalized provider interface over heterogeneous model backends.
//!
//! Every adapter translates its backend's wire format into these types, so
//! the orchestration engine never sees protocol-specific payloads. Streaming
//! backends are normalized to a single response inside the adapter.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An image attached to a message (raw bytes base64-encoded plus media type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    pub data: String,
    pub media_type: String,
}

impl ImageData {
    /// Encode raw image bytes for transport.
    pub fn from_bytes(bytes: &[u8], media_type: impl Into<String>) -> Self {
        use base64::Engine;
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            media_type: media_type.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool the model may call, in a backend-independent schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool parameters.
    pub parameters: serde_json::Value,
}

/// A single normalized chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Reasoning/thinking trace, where the backend produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Set on `Role::Tool` messages to correlate with the originating call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Attached images for vision-capable models.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageData>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool-result message.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Attach images to the message.
    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }

    /// Attach a reasoning trace.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    Unknown,
}

/// A completion request. The concrete model is supplied separately by the
/// caller (registry resolution happens above this layer).
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Opaque policy text sent as the system prompt; never interpreted here.
    pub system: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Request a reasoning trace where the backend supports one.
    pub reasoning: Option<bool>,
}

impl CompletionRequest {
    /// Create a request from a list of messages.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.reasoning = Some(reasoning);
        self
    }
}

/// A normalized completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// Plain-text response with no usage data, used by test providers.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        }
    }
}

/// Capability flags advertised by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Function/tool calling.
    #[serde(default)]
    pub tools: bool,
    /// Reasoning/thinking output.
    #[serde(default)]
    pub reasoning: bool,
    /// Image input.
    #[serde(default)]
    pub vision: bool,
}

/// Uniform call interface over a remote model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry name of this backend.
    fn name(&self) -> &str;

    /// What this backend can do.
    fn capabilities(&self) -> Capabilities;

    /// (input, output) cost per token for the given model.
    fn cost_per_token(&self, model: &str) -> (Decimal, Decimal);

    /// Run one chat completion against a concrete model.
    async fn complete(
        &self,
        model: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError>;

    /// List model identifiers available on this backend.
    async fn list_models(&self) -> Result<Vec<String>, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "hello");
        assert!(msg.tool_calls.is_empty());

        let tool = ChatMessage::tool("call-1", "result");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_request_builder() {
        let req = CompletionRequest::new(vec![ChatMessage::user("hi")])
            .with_system("be terse")
            .with_max_tokens(256)
            .with_temperature(0.3);
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.max_tokens, Some(256));
        assert_eq!(req.temperature, Some(0.3));
    }

    #[test]
    fn test_image_from_bytes_encodes_base64() {
        let image = ImageData::from_bytes(b"hello", "image/png");
        assert_eq!(image.data, "aGVsbG8=");
        assert_eq!(image.media_type, "image/png");
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = ChatMessage::assistant("done").with_reasoning("thought about it");
        let json = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, "done");
        assert_eq!(back.reasoning.as_deref(), Some("thought about it"));
    }
}
