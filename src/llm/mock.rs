//! Scripted provider for deterministic tests.
//!
//! Responses are served from a queue; when the queue is empty the default
//! response (or failure mode) applies. Every call is recorded so tests can
//! assert on attempt counts and payloads.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::provider::{
    Capabilities, CompletionRequest, CompletionResponse, LlmProvider,
};

/// Outcome the mock should produce for one call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Ok(String),
    Timeout,
    Protocol(String),
}

impl MockOutcome {
    fn into_result(self, provider: &str) -> Result<CompletionResponse, LlmError> {
        match self {
            MockOutcome::Ok(text) => Ok(CompletionResponse::text(text)),
            MockOutcome::Timeout => Err(LlmError::Timeout {
                provider: provider.to_string(),
                seconds: 0,
            }),
            MockOutcome::Protocol(reason) => Err(LlmError::Protocol {
                provider: provider.to_string(),
                reason,
            }),
        }
    }
}

/// A recorded call: the concrete model plus the request payload.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub request: CompletionRequest,
}

/// Scripted LLM provider.
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<MockOutcome>>,
    default_outcome: Mutex<MockOutcome>,
    calls: Mutex<Vec<RecordedCall>>,
    models: Vec<String>,
}

impl MockProvider {
    /// Provider that answers every call with a fixed text.
    pub fn new(name: impl Into<String>, default_response: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            default_outcome: Mutex::new(MockOutcome::Ok(default_response.into())),
            calls: Mutex::new(Vec::new()),
            models: vec!["mock-model".to_string()],
        }
    }

    /// Arc-wrapped provider with a generic default response.
    pub fn named(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name, "ok"))
    }

    /// Provider that fails every call with a timeout.
    pub fn failing(name: impl Into<String>) -> Arc<Self> {
        let mock = Self::new(name, "");
        *mock.default_outcome.lock().unwrap() = MockOutcome::Timeout;
        Arc::new(mock)
    }

    /// Queue one outcome ahead of the default.
    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Queue a successful response.
    pub fn push_ok(&self, text: impl Into<String>) {
        self.push(MockOutcome::Ok(text.into()));
    }

    /// Change the default outcome used when the queue is empty.
    pub fn set_default(&self, outcome: MockOutcome) {
        *self.default_outcome.lock().unwrap() = outcome;
    }

    /// Number of completion calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// All recorded calls.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tools: true,
            reasoning: false,
            vision: false,
        }
    }

    fn cost_per_token(&self, _model: &str) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(
        &self,
        model: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        self.calls.lock().unwrap().push(RecordedCall {
            model: model.to_string(),
            request,
        });
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.lock().unwrap().clone());
        outcome.into_result(&self.name)
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(self.models.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    #[tokio::test]
    async fn test_scripted_outcomes_then_default() {
        let mock = MockProvider::new("m", "default");
        mock.push_ok("first");
        mock.push(MockOutcome::Timeout);

        let req = || CompletionRequest::new(vec![ChatMessage::user("hi")]);
        let first = mock.complete("x", req()).await.unwrap();
        assert_eq!(first.content, "first");

        let second = mock.complete("x", req()).await;
        assert!(matches!(second, Err(LlmError::Timeout { .. })));

        let third = mock.complete("x", req()).await.unwrap();
        assert_eq!(third.content, "default");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_records_model_and_payload() {
        let mock = MockProvider::new("m", "ok");
        let req = CompletionRequest::new(vec![ChatMessage::user("payload")]);
        mock.complete("qwen3:4b", req).await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls[0].model, "qwen3:4b");
        assert_eq!(calls[0].request.messages[0].content, "payload");
    }
}
