//! Sessions and turns.
//!
//! A session is the append-only conversation state for one channel. Turns are
//! immutable once appended; compaction never rewrites them. It installs a
//! synthetic summary turn and advances a superseded watermark, so superseded
//! turns stay on disk but drop out of outbound requests.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::agent::context_monitor::estimate_turn_tokens;
use crate::llm::{ChatMessage, Role, ToolCall};

/// One immutable conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Marks synthetic summary turns produced by compaction.
    #[serde(default)]
    pub summary: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            summary: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Synthetic summary turn installed by compaction.
    pub fn summary(content: impl Into<String>) -> Self {
        let mut turn = Self::new(Role::System, content);
        turn.summary = true;
        turn
    }

    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Convert to the outbound message shape.
    pub fn to_message(&self) -> ChatMessage {
        let mut msg = match self.role {
            Role::System => ChatMessage::system(&self.content),
            Role::User => ChatMessage::user(&self.content),
            Role::Assistant => ChatMessage::assistant(&self.content),
            Role::Tool => ChatMessage::tool("", &self.content),
        };
        msg.tool_calls = self.tool_calls.clone();
        msg
    }
}

/// Conversation state for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub channel: String,
    /// Full turn history, oldest first. Never truncated in memory.
    pub turns: Vec<Turn>,
    /// Index of the first turn still included in outbound requests.
    pub superseded: usize,
    /// Latest folded summary covering `turns[..superseded]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Turn>,
    /// Sticky model selection for this session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Running token estimate over the active view.
    #[serde(skip)]
    pub token_estimate: usize,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(channel: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            turns: Vec::new(),
            superseded: 0,
            summary: None,
            model: None,
            token_estimate: 0,
            created_at: now,
            last_active_at: now,
        }
    }

    /// Append a turn in submission order.
    pub fn append(&mut self, turn: Turn) {
        self.token_estimate += estimate_turn_tokens(&turn);
        self.last_active_at = turn.created_at;
        self.turns.push(turn);
    }

    /// Turns currently part of outbound requests (after the watermark).
    pub fn active_turns(&self) -> &[Turn] {
        &self.turns[self.superseded..]
    }

    /// Install a compaction result: a new summary covering everything before
    /// `keep_from` (an index into `active_turns`). Existing turns are never
    /// mutated.
    pub fn apply_compaction(&mut self, summary: Turn, keep_from: usize) {
        self.superseded = (self.superseded + keep_from).min(self.turns.len());
        self.summary = Some(summary);
        self.recompute_estimate();
    }

    /// Outbound message list: folded summary (if any) plus active turns.
    pub fn outbound_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.active_turns().len() + 1);
        if let Some(summary) = &self.summary {
            out.push(summary.to_message());
        }
        out.extend(self.active_turns().iter().map(Turn::to_message));
        out
    }

    fn recompute_estimate(&mut self) {
        self.token_estimate = self
            .summary
            .iter()
            .chain(self.active_turns().iter())
            .map(estimate_turn_tokens)
            .sum();
    }
}

/// Manages sessions keyed by channel, with per-session serialization.
///
/// The per-session mutex is held across a whole orchestration turn, so two
/// in-flight compactions or model calls can never interleave on one session.
/// Different sessions share nothing mutable.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the session for a channel, creating it on first use.
    ///
    /// Returns `(handle, created)` so the caller can persist session metadata
    /// exactly once.
    pub async fn get_or_create(&self, channel: &str) -> (Arc<Mutex<Session>>, bool) {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(channel) {
                return (Arc::clone(session), false);
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring the write lock
        if let Some(session) = sessions.get(channel) {
            return (Arc::clone(session), false);
        }

        let session = Arc::new(Mutex::new(Session::new(channel)));
        sessions.insert(channel.to_string(), Arc::clone(&session));
        (session, true)
    }

    /// Install a session restored from the turn log.
    pub async fn attach(&self, session: Session) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.channel.clone(), Arc::new(Mutex::new(session)));
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_append_preserves_order() {
        let mut session = Session::new("cli");
        session.append(Turn::user("first"));
        session.append(Turn::assistant("second"));
        session.append(Turn::user("third"));

        let contents: Vec<&str> = session
            .turns
            .iter()
            .map(|t| t.content.as_str())
            .collect();
        assert_eq!(contents, ["first", "second", "third"]);
    }

    #[test]
    fn test_compaction_supersedes_prefix_without_mutating_turns() {
        let mut session = Session::new("cli");
        for i in 0..6 {
            session.append(Turn::user(format!("turn {}", i)));
        }

        session.apply_compaction(Turn::summary("[summary] early turns"), 4);

        // Full history retained
        assert_eq!(session.turns.len(), 6);
        assert_eq!(session.turns[0].content, "turn 0");
        // Active view starts at the watermark
        assert_eq!(session.active_turns().len(), 2);
        assert_eq!(session.active_turns()[0].content, "turn 4");

        // Outbound view: summary first, then recent turns
        let outbound = session.outbound_messages();
        assert_eq!(outbound.len(), 3);
        assert!(outbound[0].content.contains("[summary]"));
        assert_eq!(outbound[1].content, "turn 4");
    }

    #[test]
    fn test_second_compaction_folds_previous_summary() {
        let mut session = Session::new("cli");
        for i in 0..8 {
            session.append(Turn::user(format!("turn {}", i)));
        }
        session.apply_compaction(Turn::summary("first summary"), 6);
        assert_eq!(session.active_turns().len(), 2);

        session.append(Turn::user("turn 8"));
        session.apply_compaction(Turn::summary("second summary"), 2);

        // Watermark advanced cumulatively: 6 + 2 = 8
        assert_eq!(session.superseded, 8);
        assert_eq!(session.active_turns().len(), 1);
        assert_eq!(
            session.summary.as_ref().unwrap().content,
            "second summary"
        );
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let manager = SessionManager::new();
        let (first, created_first) = manager.get_or_create("telegram").await;
        let (second, created_second) = manager.get_or_create("telegram").await;

        assert!(created_first);
        assert!(!created_second);
        assert!(Arc::ptr_eq(&first, &second));

        let (other, _) = manager.get_or_create("discord").await;
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn test_attach_restored_session() {
        let manager = SessionManager::new();
        let mut session = Session::new("matrix");
        session.append(Turn::user("restored"));
        let id = session.id;
        manager.attach(session).await;

        let (handle, created) = manager.get_or_create("matrix").await;
        assert!(!created);
        let guard = handle.lock().await;
        assert_eq!(guard.id, id);
        assert_eq!(guard.turns.len(), 1);
    }
}
