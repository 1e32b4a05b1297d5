//! One-shot delegated model invocations.
//!
//! A subagent call carries no conversation history and a restricted tool
//! schema: nothing that schedules work, mutates configuration, or dispatches
//! further subagents; delegation depth is fixed at one level. Calls bypass
//! the fallback chain; the policy is a single retry with identical input,
//! after which the failure is surfaced to the orchestrating agent.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionRequest, ProviderRegistry, ResolvedModel, ToolDefinition,
};

/// Tools a subagent may carry. Everything else is stripped.
pub const SUBAGENT_TOOL_ALLOWLIST: &[&str] = &["exec", "web_search", "check_url", "read_url"];

/// Delay between the failed first attempt and the single retry.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

const DEFAULT_SYSTEM_PROMPT: &str = "You are a delegated assistant. Answer the task precisely \
     and concisely. If you cannot answer, say so clearly. Stay on topic.";

/// Dispatches one-shot, history-less model invocations.
pub struct SubagentDispatcher {
    registry: Arc<ProviderRegistry>,
    system_prompt: String,
    tools: Vec<ToolDefinition>,
    attempt_timeout: Duration,
    retry_delay: Duration,
}

impl SubagentDispatcher {
    /// Create a dispatcher. `tools` is filtered against the allow-list;
    /// `system_prompt` is opaque policy text (`None` = built-in default).
    pub fn new(
        registry: Arc<ProviderRegistry>,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            tools: restrict_tools(tools),
            attempt_timeout,
            retry_delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Invoke a model with a single task message and the default subagent
    /// system prompt.
    pub async fn invoke(&self, model_ref: &str, task: &str) -> Result<String, LlmError> {
        self.invoke_with(model_ref, &self.system_prompt, task).await
    }

    /// Invoke with a caller-supplied system prompt (used by the debate
    /// orchestrator for persona instructions).
    pub async fn invoke_with(
        &self,
        model_ref: &str,
        system: &str,
        task: &str,
    ) -> Result<String, LlmError> {
        let resolved = self.registry.resolve(Some(model_ref))?;
        info!(model = %resolved, "subagent dispatch");

        let first = match self.attempt(&resolved, system, task).await {
            Ok(content) => return Ok(content),
            Err(e) => e.brief(),
        };
        warn!(model = %resolved, error = %first, "subagent attempt failed, retrying once");
        tokio::time::sleep(self.retry_delay).await;

        match self.attempt(&resolved, system, task).await {
            Ok(content) => Ok(content),
            Err(e) => Err(LlmError::SubagentFailed {
                model: resolved.to_string(),
                first,
                second: e.brief(),
            }),
        }
    }

    async fn attempt(
        &self,
        resolved: &ResolvedModel,
        system: &str,
        task: &str,
    ) -> Result<String, LlmError> {
        let provider =
            self.registry
                .provider(&resolved.provider)
                .ok_or_else(|| LlmError::UnknownModel {
                    provider: resolved.provider.clone(),
                    model: resolved.model.clone(),
                })?;

        let request = CompletionRequest::new(vec![ChatMessage::user(task)])
            .with_system(system)
            .with_tools(self.tools.clone());

        let response = tokio::time::timeout(
            self.attempt_timeout,
            provider.complete(&resolved.model, request),
        )
        .await
        .map_err(|_| LlmError::Timeout {
            provider: resolved.provider.clone(),
            seconds: self.attempt_timeout.as_secs(),
        })??;

        Ok(response.content)
    }
}

/// Drop every tool not on the subagent allow-list.
fn restrict_tools(tools: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
    tools
        .into_iter()
        .filter(|t| SUBAGENT_TOOL_ALLOWLIST.contains(&t.name.as_str()))
        .collect()
}
