//! LLM integration: normalized provider interface, registry, and fallback.
//!
//! Three wire protocols are supported (Ollama, OpenAI-compatible, Anthropic);
//! everything above the adapters works with normalized types only. Model
//! resolution and the ordered fallback chain live here as well.

mod anthropic;
mod fallback;
pub mod mock;
mod ollama;
mod openai;
mod provider;
mod registry;

pub use anthropic::{AnthropicProvider, AnthropicSettings};
pub use fallback::{ChainResponse, FallbackChain};
pub use ollama::{OllamaProvider, OllamaSettings};
pub use openai::{OpenAiProvider, OpenAiSettings};
pub use provider::{
    Capabilities, ChatMessage, CompletionRequest, CompletionResponse, FinishReason, ImageData,
    LlmProvider, Role, ToolCall, ToolDefinition,
};
pub use registry::{
    BackendDescriptor, BackendOverview, ModelTable, Protocol, ProviderRegistry, ResolvedModel,
};
