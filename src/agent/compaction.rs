//! Token-budget-aware context compaction.
//!
//! When a pending request exceeds the window quota, the older part of the
//! conversation is replaced by a model-generated digest while a recent suffix
//! (about 15% of the window) is kept verbatim. Stored turns are never
//! mutated; the caller installs the result via `Session::apply_compaction`.
//! A failed summarization call degrades to sending the request uncompacted.

use tracing::{debug, info};

use crate::agent::context_monitor::{ContextMonitor, estimate_turn_tokens};
use crate::agent::session::Turn;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, Role};

const SUMMARY_SYSTEM: &str = "You are a summarization assistant. Summarize the conversation \
     history concisely and precisely. Keep: facts, decisions, open tasks, user preferences, \
     important results, tool calls and their outcomes. Format: bullet points, at most 400 \
     words. Reply ONLY with the summary, no preamble.";

const SUMMARY_HEADER: &str = "[Summary of the conversation so far]";

/// Per-role character caps when rendering the older prefix for the
/// summarizer.
const USER_EXCERPT: usize = 1000;
const ASSISTANT_EXCERPT: usize = 800;
const TOOL_EXCERPT: usize = 800;
const SYSTEM_EXCERPT: usize = 300;

/// Result of one compaction: the synthetic summary turn plus the index
/// (into the active turn slice) from which turns are kept verbatim.
#[derive(Debug)]
pub struct Compacted {
    pub summary: Turn,
    pub keep_from: usize,
}

/// Compacts session context against a token budget.
#[derive(Debug, Clone)]
pub struct ContextCompactor {
    monitor: ContextMonitor,
}

impl ContextCompactor {
    pub fn new(monitor: ContextMonitor) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &ContextMonitor {
        &self.monitor
    }

    /// Find the split point: the smallest suffix, taken from the end, whose
    /// cumulative estimate meets or exceeds the recent-turn reserve. The
    /// suffix is never smaller than one full turn, and there must be
    /// something left in front of it to summarize.
    fn split_point(&self, prior_summary: Option<&Turn>, turns: &[Turn]) -> Option<usize> {
        if turns.is_empty() {
            return None;
        }
        let reserve = self.monitor.recent_reserve();
        let mut cumulative = 0usize;
        let mut keep_from = turns.len();
        for (index, turn) in turns.iter().enumerate().rev() {
            cumulative += estimate_turn_tokens(turn);
            keep_from = index;
            if cumulative >= reserve {
                break;
            }
        }
        // Nothing in front of the suffix and no prior summary to fold: the
        // request is oversized for other reasons, compaction cannot help
        if keep_from == 0 && prior_summary.is_none() {
            return None;
        }
        Some(keep_from)
    }

    /// Run one compaction over the active view of a session.
    ///
    /// Issues exactly one summarization call. Returns `Ok(None)` when there
    /// is nothing worth summarizing; errors mean the caller should proceed
    /// uncompacted this turn.
    pub async fn compact(
        &self,
        provider: &dyn LlmProvider,
        model: &str,
        prior_summary: Option<&Turn>,
        turns: &[Turn],
    ) -> Result<Option<Compacted>, LlmError> {
        let Some(keep_from) = self.split_point(prior_summary, turns) else {
            debug!("compaction skipped: no older prefix to summarize");
            return Ok(None);
        };

        let rendered = render_for_summary(prior_summary, &turns[..keep_from]);
        if rendered.trim().is_empty() {
            return Ok(None);
        }

        let request = CompletionRequest::new(vec![ChatMessage::user(format!(
            "Summarize this conversation history:\n\n{}",
            rendered
        ))])
        .with_system(SUMMARY_SYSTEM)
        .with_max_tokens(1024)
        .with_temperature(0.3);

        let response = provider.complete(model, request).await?;
        let summary = response.content.trim();
        if summary.is_empty() {
            return Err(LlmError::Protocol {
                provider: provider.name().to_string(),
                reason: "summarization returned empty content".to_string(),
            });
        }

        info!(
            superseded = keep_from,
            kept = turns.len() - keep_from,
            summary_tokens = crate::agent::context_monitor::estimate_text_tokens(summary),
            "context compacted"
        );

        Ok(Some(Compacted {
            summary: Turn::summary(format!("{}\n{}", SUMMARY_HEADER, summary)),
            keep_from,
        }))
    }
}

/// Render the older prefix as role-tagged text for the summarizer. Tool
/// calls with empty content are captured explicitly so their outcomes
/// survive into the digest.
fn render_for_summary(prior_summary: Option<&Turn>, turns: &[Turn]) -> String {
    let mut lines: Vec<String> = Vec::new();
    if let Some(summary) = prior_summary {
        lines.push(format!("[Earlier summary]: {}", excerpt(&summary.content, USER_EXCERPT)));
    }
    for turn in turns {
        for call in &turn.tool_calls {
            let args = call.arguments.to_string();
            lines.push(format!(
                "[Tool call: {}({})]",
                call.name,
                excerpt(&args, 300)
            ));
        }
        let content = turn.content.trim();
        if content.is_empty() {
            continue;
        }
        match turn.role {
            Role::User => lines.push(format!("User: {}", excerpt(content, USER_EXCERPT))),
            Role::Assistant => {
                lines.push(format!("Assistant: {}", excerpt(content, ASSISTANT_EXCERPT)))
            }
            Role::Tool => lines.push(format!("[Tool result]: {}", excerpt(content, TOOL_EXCERPT))),
            Role::System => lines.push(format!("[System]: {}", excerpt(content, SYSTEM_EXCERPT))),
        }
    }
    lines.join("\n")
}

fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::session::Session;
    use crate::llm::mock::{MockOutcome, MockProvider};

    fn turn_with_tokens(role: Role, approx_tokens: usize) -> Turn {
        // estimate = len/3 + 4 overhead
        let content = "x".repeat(approx_tokens.saturating_sub(4) * 3);
        match role {
            Role::User => Turn::user(content),
            _ => Turn::assistant(content),
        }
    }

    fn compactor(window: usize) -> ContextCompactor {
        ContextCompactor::new(ContextMonitor::new(window).with_quota(0.85))
    }

    #[test]
    fn test_split_takes_smallest_sufficient_suffix() {
        // window 1000 -> reserve 150. Turns of ~100 tokens each.
        let compactor = compactor(1000);
        let turns: Vec<Turn> = (0..6).map(|_| turn_with_tokens(Role::User, 100)).collect();
        // From the end: 100 < 150, 200 >= 150 -> keep last two turns.
        let keep_from = compactor.split_point(None, &turns).unwrap();
        assert_eq!(keep_from, 4);
    }

    #[test]
    fn test_split_never_below_one_turn() {
        let compactor = compactor(1000);
        // A single huge recent turn exceeds the reserve on its own
        let turns = vec![
            turn_with_tokens(Role::User, 50),
            turn_with_tokens(Role::User, 500),
        ];
        let keep_from = compactor.split_point(None, &turns).unwrap();
        assert_eq!(keep_from, 1);
    }

    #[test]
    fn test_split_requires_an_older_prefix() {
        let compactor = compactor(1000);
        let turns = vec![turn_with_tokens(Role::User, 500)];
        assert!(compactor.split_point(None, &turns).is_none());

        // With a prior summary to fold, the same shape is compactable
        let prior = Turn::summary("[Summary of the conversation so far]\nolder facts");
        assert_eq!(compactor.split_point(Some(&prior), &turns), Some(0));
    }

    #[tokio::test]
    async fn test_compact_issues_exactly_one_call() {
        let provider = MockProvider::new("local", "the digest");
        let compactor = compactor(1000);
        let turns: Vec<Turn> = (0..8).map(|_| turn_with_tokens(Role::User, 100)).collect();

        let compacted = compactor
            .compact(&provider, "qwen3:14b", None, &turns)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(provider.call_count(), 1);
        assert!(compacted.summary.summary);
        assert!(compacted.summary.content.starts_with(SUMMARY_HEADER));
        assert!(compacted.summary.content.contains("the digest"));
        assert!(compacted.keep_from > 0);
    }

    #[tokio::test]
    async fn test_failed_summarization_propagates() {
        let provider = MockProvider::new("local", "");
        provider.set_default(MockOutcome::Timeout);
        let compactor = compactor(1000);
        let turns: Vec<Turn> = (0..8).map(|_| turn_with_tokens(Role::User, 100)).collect();

        let err = compactor
            .compact(&provider, "qwen3:14b", None, &turns)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_summary_is_an_error() {
        let provider = MockProvider::new("local", "   ");
        let compactor = compactor(1000);
        let turns: Vec<Turn> = (0..8).map(|_| turn_with_tokens(Role::User, 100)).collect();

        let err = compactor
            .compact(&provider, "qwen3:14b", None, &turns)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_budget_scenario_window_8000() {
        // Window 8000, quota 0.85 -> budget 6800; history estimates ~9000.
        let monitor = ContextMonitor::new(8000).with_quota(0.85);
        let compactor = ContextCompactor::new(monitor.clone());

        let mut session = Session::new("cli");
        for _ in 0..30 {
            session.append(turn_with_tokens(Role::User, 150));
            session.append(turn_with_tokens(Role::Assistant, 150));
        }
        let outbound = session.outbound_messages();
        let before = monitor.estimate_request("", &[], &outbound);
        assert!(before > 8900 && before < 9100, "estimate was {}", before);
        assert!(monitor.needs_compaction("", &[], &outbound));

        let provider = MockProvider::new("local", "compact digest of earlier turns");
        let compacted = compactor
            .compact(&provider, "m", session.summary.as_ref(), session.active_turns())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(provider.call_count(), 1);

        let keep_from = compacted.keep_from;
        session.apply_compaction(compacted.summary, keep_from);

        let after = monitor.estimate_request("", &[], &session.outbound_messages());
        assert!(after <= 6800, "outbound estimate {} exceeds budget", after);
    }

    #[tokio::test]
    async fn test_fact_survives_into_summary_input() {
        // The summarizer is given the older prefix containing the fact, and
        // the summary turn carries whatever the model returns.
        let provider = MockProvider::new("local", "User's cat is named Ziggy.");
        let compactor = compactor(1000);

        let mut turns: Vec<Turn> = vec![Turn::user("my cat is named Ziggy, remember that")];
        for _ in 0..8 {
            turns.push(turn_with_tokens(Role::Assistant, 100));
        }

        let compacted = compactor
            .compact(&provider, "m", None, &turns)
            .await
            .unwrap()
            .unwrap();

        let sent = &provider.calls()[0].request.messages[0].content;
        assert!(sent.contains("Ziggy"), "fact missing from summarizer input");
        assert!(compacted.summary.content.contains("Ziggy"));
    }
}
