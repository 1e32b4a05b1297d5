//! Error types for all steward subsystems.
//!
//! One enum per subsystem. Backend errors are recovered locally by the
//! fallback chain; everything that escapes a subsystem boundary is one of
//! these structured variants, never a raw transport error. Credentials never
//! appear in any `Display` output.

use thiserror::Error;
use uuid::Uuid;

/// One attempt made by the fallback chain, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Registry name of the backend that was tried.
    pub provider: String,
    /// Concrete model identifier sent to the backend.
    pub model: String,
    /// Error message for failed attempts, `None` for the successful one.
    pub error: Option<String>,
    /// Wall-clock duration of the attempt.
    pub latency_ms: u64,
}

impl AttemptRecord {
    /// Render the attempt list for user-visible failure messages.
    pub fn describe(attempts: &[AttemptRecord]) -> String {
        attempts
            .iter()
            .map(|a| match &a.error {
                Some(e) => format!("{}/{}: {}", a.provider, a.model, e),
                None => format!("{}/{}: ok", a.provider, a.model),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Errors from model backends and the resolution/fallback layer.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The requested model matched nothing in the chosen provider.
    #[error("unknown model '{model}' for provider '{provider}'")]
    UnknownModel { provider: String, model: String },

    /// The backend did not answer within the attempt timeout.
    #[error("{provider} request timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    /// Non-2xx status or a response the adapter could not decode.
    #[error("{provider} protocol error: {reason}")]
    Protocol { provider: String, reason: String },

    /// Every candidate backend failed; carries the ordered attempt log.
    #[error("all backends exhausted after {} attempt(s): {}", .attempts.len(), AttemptRecord::describe(.attempts))]
    Exhausted { attempts: Vec<AttemptRecord> },

    /// A delegated one-shot call failed on both the original attempt and
    /// the single retry.
    #[error("subagent call to '{model}' failed (attempt: {first}; retry: {second})")]
    SubagentFailed {
        model: String,
        first: String,
        second: String,
    },

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LlmError {
    /// Short description without nested sources, used in attempt records.
    pub fn brief(&self) -> String {
        match self {
            LlmError::Http(e) if e.is_timeout() => "timeout".to_string(),
            LlmError::Http(e) if e.is_connect() => "connection failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Errors from the persistence boundary (turn log, job store, transcripts).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {what}: {source}")]
    Write {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {what}: {source}")]
    Read {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record in {what}: {reason}")]
    Corrupt { what: String, reason: String },

    #[error("job {0} not found")]
    JobNotFound(Uuid),
}

/// Errors from the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid trigger '{input}': {reason}")]
    InvalidTrigger { input: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the debate orchestrator.
#[derive(Debug, Error)]
pub enum DebateError {
    #[error("round limit {0} is outside the allowed range 1..=10")]
    InvalidRounds(u32),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the chat-platform connector boundary.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel '{name}' not registered")]
    NotFound { name: String },

    #[error("failed to deliver to '{name}': {reason}")]
    DeliveryFailed { name: String, reason: String },
}

/// Errors detected while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error for orchestration-engine operations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("subagent delegation is disabled in configuration")]
    SubagentsDisabled,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Debate(#[from] DebateError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_lists_attempts() {
        let err = LlmError::Exhausted {
            attempts: vec![
                AttemptRecord {
                    provider: "local".into(),
                    model: "qwen3:14b".into(),
                    error: Some("timeout".into()),
                    latency_ms: 1200,
                },
                AttemptRecord {
                    provider: "cloud".into(),
                    model: "gpt-4o-mini".into(),
                    error: Some("HTTP 500".into()),
                    latency_ms: 300,
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 attempt(s)"));
        assert!(text.contains("local/qwen3:14b: timeout"));
        assert!(text.contains("cloud/gpt-4o-mini: HTTP 500"));
    }

    #[test]
    fn test_unknown_model_message() {
        let err = LlmError::UnknownModel {
            provider: "local".into(),
            model: "nope".into(),
        };
        assert_eq!(err.to_string(), "unknown model 'nope' for provider 'local'");
    }
}
