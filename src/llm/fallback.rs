//! Ordered fallback across alternate (backend, model) pairs.
//!
//! A chain call first tries the resolved primary, then the primary provider's
//! own fallback list, then the global fallback list, each attempt with the
//! identical payload. The first success wins. Every attempt is logged and
//! recorded; total failure surfaces the whole attempt log.
//!
//! Subagent and debate-participant calls do NOT go through the chain; those
//! use the dispatcher's single-retry policy instead.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{AttemptRecord, LlmError};
use crate::llm::provider::{CompletionRequest, CompletionResponse};
use crate::llm::registry::{ProviderRegistry, ResolvedModel};

/// A chain result: the winning response plus the full attempt history.
#[derive(Debug)]
pub struct ChainResponse {
    pub response: CompletionResponse,
    /// The pair that actually answered.
    pub served_by: ResolvedModel,
    /// Set when a non-primary pair answered; carries the primary's failure.
    pub switched_from: Option<(ResolvedModel, String)>,
    /// Ordered log of every attempt, including the successful one.
    pub attempts: Vec<AttemptRecord>,
}

/// Resolution & fallback chain over the provider registry.
pub struct FallbackChain {
    registry: Arc<ProviderRegistry>,
    global_fallbacks: Vec<String>,
}

impl FallbackChain {
    pub fn new(registry: Arc<ProviderRegistry>, global_fallbacks: Vec<String>) -> Self {
        Self {
            registry,
            global_fallbacks,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Candidate pairs for a request: primary, provider fallbacks, global
    /// fallbacks, resolved and deduplicated with order preserved. Fallback entries
    /// that no longer resolve are skipped with a warning.
    fn candidates(&self, model_ref: Option<&str>) -> Result<Vec<ResolvedModel>, LlmError> {
        let primary = self.registry.resolve(model_ref)?;

        let mut refs: Vec<String> = self.registry.provider_fallbacks(&primary.provider);
        for global in &self.global_fallbacks {
            if !refs.contains(global) {
                refs.push(global.clone());
            }
        }

        let mut out = vec![primary];
        for reference in refs {
            match self.registry.resolve(Some(&reference)) {
                Ok(resolved) => {
                    if !out.contains(&resolved) {
                        out.push(resolved);
                    }
                }
                Err(e) => {
                    tracing::warn!(fallback = %reference, error = %e, "skipping unresolvable fallback entry");
                }
            }
        }
        Ok(out)
    }

    /// Run a completion with ordered fallback.
    pub async fn complete(
        &self,
        model_ref: Option<&str>,
        request: CompletionRequest,
    ) -> Result<ChainResponse, LlmError> {
        let candidates = self.candidates(model_ref)?;
        let primary = candidates[0].clone();
        let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(candidates.len());
        let mut primary_error: Option<String> = None;

        for candidate in candidates {
            let provider = match self.registry.provider(&candidate.provider) {
                Some(p) => p,
                None => continue, // registry replaced mid-flight; skip
            };

            let started = Instant::now();
            let result = provider.complete(&candidate.model, request.clone()).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    tracing::info!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        latency_ms,
                        outcome = "success",
                        "backend attempt"
                    );
                    attempts.push(AttemptRecord {
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        error: None,
                        latency_ms,
                    });
                    let switched_from = if candidate != primary {
                        Some((
                            primary,
                            primary_error.unwrap_or_else(|| "request failed".to_string()),
                        ))
                    } else {
                        None
                    };
                    return Ok(ChainResponse {
                        response,
                        served_by: candidate,
                        switched_from,
                        attempts,
                    });
                }
                Err(e) => {
                    let brief = e.brief();
                    tracing::warn!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        latency_ms,
                        outcome = "failure",
                        error = %brief,
                        "backend attempt"
                    );
                    if candidate == primary {
                        primary_error = Some(brief.clone());
                    }
                    attempts.push(AttemptRecord {
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        error: Some(brief),
                        latency_ms,
                    });
                }
            }
        }

        Err(LlmError::Exhausted { attempts })
    }
}
