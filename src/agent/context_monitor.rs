//! Context window monitoring and compaction triggers.
//!
//! Estimates request size without a tokenizer and decides when the pending
//! request exceeds the configured share of the model's context window.

use crate::agent::session::Turn;
use crate::llm::{ChatMessage, Role, ToolDefinition};

/// Default context window when the backend does not configure one.
pub const DEFAULT_CONTEXT_WINDOW: usize = 32_768;

/// Default share of the window a request may occupy before compaction.
pub const DEFAULT_CONTEXT_QUOTA: f64 = 0.85;

/// Share of the window reserved for the uncompacted recent suffix.
const RECENT_RESERVE_RATIO: f64 = 0.15;

/// Conservative chars-per-token ratio for mixed-language text.
const CHARS_PER_TOKEN: f64 = 3.0;

/// Structural overhead per message (role, framing).
const MESSAGE_OVERHEAD: usize = 4;

/// Estimate tokens for raw text.
pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    ((text.len() as f64 / CHARS_PER_TOKEN) as usize).max(1)
}

/// Estimate tokens for one outbound message.
pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    let mut tokens = estimate_text_tokens(&message.content) + MESSAGE_OVERHEAD;
    if let Some(reasoning) = &message.reasoning {
        tokens += estimate_text_tokens(reasoning);
    }
    if !message.tool_calls.is_empty() {
        let serialized = serde_json::to_string(&message.tool_calls).unwrap_or_default();
        tokens += estimate_text_tokens(&serialized);
    }
    tokens
}

/// Estimate tokens for a stored turn.
pub fn estimate_turn_tokens(turn: &Turn) -> usize {
    let mut tokens = estimate_text_tokens(&turn.content) + MESSAGE_OVERHEAD;
    if let Some(reasoning) = &turn.reasoning {
        tokens += estimate_text_tokens(reasoning);
    }
    if !turn.tool_calls.is_empty() {
        let serialized = serde_json::to_string(&turn.tool_calls).unwrap_or_default();
        tokens += estimate_text_tokens(&serialized);
    }
    tokens
}

/// Estimate tokens for a tool schema.
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    if tools.is_empty() {
        return 0;
    }
    let serialized = serde_json::to_string(tools).unwrap_or_default();
    estimate_text_tokens(&serialized)
}

/// Monitors request size against a context window and quota.
#[derive(Debug, Clone)]
pub struct ContextMonitor {
    window: usize,
    quota: f64,
}

impl ContextMonitor {
    /// Create a monitor for a given context window with the default quota.
    pub fn new(window: usize) -> Self {
        Self {
            window,
            quota: DEFAULT_CONTEXT_QUOTA,
        }
    }

    /// Set the quota, clamped to the valid 0.5–0.95 range.
    pub fn with_quota(mut self, quota: f64) -> Self {
        self.quota = quota.clamp(0.5, 0.95);
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Maximum allowed tokens for system prompt + tools + messages.
    pub fn budget(&self) -> usize {
        (self.window as f64 * self.quota) as usize
    }

    /// Token target for the recent suffix kept verbatim during compaction.
    pub fn recent_reserve(&self) -> usize {
        (self.window as f64 * RECENT_RESERVE_RATIO) as usize
    }

    /// Estimate the full pending request.
    pub fn estimate_request(
        &self,
        system: &str,
        tools: &[ToolDefinition],
        messages: &[ChatMessage],
    ) -> usize {
        estimate_text_tokens(system)
            + estimate_tools_tokens(tools)
            + messages.iter().map(estimate_message_tokens).sum::<usize>()
    }

    /// Whether the pending request exceeds the budget.
    pub fn needs_compaction(
        &self,
        system: &str,
        tools: &[ToolDefinition],
        messages: &[ChatMessage],
    ) -> bool {
        self.estimate_request(system, tools, messages) > self.budget()
    }
}

/// Context size breakdown for logging.
#[derive(Debug, Clone, Default)]
pub struct ContextBreakdown {
    pub total_tokens: usize,
    pub system_tokens: usize,
    pub user_tokens: usize,
    pub assistant_tokens: usize,
    pub tool_tokens: usize,
    pub message_count: usize,
}

impl ContextBreakdown {
    /// Analyze an outbound message list.
    pub fn analyze(messages: &[ChatMessage]) -> Self {
        let mut breakdown = Self {
            message_count: messages.len(),
            ..Default::default()
        };
        for message in messages {
            let tokens = estimate_message_tokens(message);
            breakdown.total_tokens += tokens;
            match message.role {
                Role::System => breakdown.system_tokens += tokens,
                Role::User => breakdown.user_tokens += tokens,
                Role::Assistant => breakdown.assistant_tokens += tokens,
                Role::Tool => breakdown.tool_tokens += tokens,
            }
        }
        breakdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_estimation_scales_with_length() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("ab"), 1);
        let text = "x".repeat(3000);
        assert_eq!(estimate_text_tokens(&text), 1000);
    }

    #[test]
    fn test_quota_clamped_to_valid_range() {
        let low = ContextMonitor::new(1000).with_quota(0.1);
        assert_eq!(low.budget(), 500);
        let high = ContextMonitor::new(1000).with_quota(1.5);
        assert_eq!(high.budget(), 950);
    }

    #[test]
    fn test_needs_compaction_threshold() {
        let monitor = ContextMonitor::new(100).with_quota(0.85);
        let small = vec![ChatMessage::user("hi")];
        assert!(!monitor.needs_compaction("", &[], &small));

        let large = vec![ChatMessage::user("y".repeat(400))];
        assert!(monitor.needs_compaction("", &[], &large));
    }

    #[test]
    fn test_system_and_tools_count_toward_budget() {
        let monitor = ContextMonitor::new(200).with_quota(0.5);
        let messages = vec![ChatMessage::user("short")];
        assert!(!monitor.needs_compaction("", &[], &messages));

        let long_system = "s".repeat(400);
        assert!(monitor.needs_compaction(&long_system, &[], &messages));

        let tools = vec![ToolDefinition {
            name: "search".into(),
            description: "d".repeat(400),
            parameters: serde_json::json!({}),
        }];
        assert!(monitor.needs_compaction("", &tools, &messages));
    }

    #[test]
    fn test_recent_reserve_is_fifteen_percent() {
        let monitor = ContextMonitor::new(8000);
        assert_eq!(monitor.recent_reserve(), 1200);
    }

    #[test]
    fn test_breakdown_by_role() {
        let messages = vec![
            ChatMessage::system("policy"),
            ChatMessage::user("question"),
            ChatMessage::assistant("answer"),
        ];
        let breakdown = ContextBreakdown::analyze(&messages);
        assert_eq!(breakdown.message_count, 3);
        assert!(breakdown.system_tokens > 0);
        assert!(breakdown.user_tokens > 0);
        assert!(breakdown.assistant_tokens > 0);
        assert_eq!(breakdown.tool_tokens, 0);
        assert_eq!(
            breakdown.total_tokens,
            breakdown.system_tokens + breakdown.user_tokens + breakdown.assistant_tokens
        );
    }
}
