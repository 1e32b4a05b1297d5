//! Structured multi-round debate between two subordinate personas.
//!
//! A state machine layered on the subagent dispatcher: per round, side A
//! argues against {rolling summary, last B argument}, side B answers
//! {rolling summary, A's argument}, then one summarization call folds the
//! round into a bounded rolling summary. Cancellation is checked before
//! every dispatch; an in-flight call is allowed to finish, but no further
//! round work starts. A failed side records an inline error marker; one
//! backend hiccup never aborts the whole debate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::subagent::SubagentDispatcher;
use crate::error::DebateError;
use crate::history::TranscriptStore;
use crate::llm::{ChatMessage, CompletionRequest, ProviderRegistry};

/// Hard upper bound on debate rounds.
pub const MAX_ROUNDS: u32 = 10;

/// Rounds used when the caller names none.
pub const DEFAULT_ROUNDS: u32 = 3;

/// Soft word target for the rolling summary, enforced by prompt only.
const SUMMARY_WORD_TARGET: u32 = 150;

/// Cooperative cancellation flag, observable between dispatch boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect before the next dispatch.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One debating side: a model reference plus the stance it argues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebatePersona {
    pub model: String,
    pub stance: String,
}

/// Parameters for one debate invocation.
#[derive(Debug, Clone)]
pub struct DebateRequest {
    pub topic: String,
    pub side_a: DebatePersona,
    pub side_b: DebatePersona,
    /// `None` = `DEFAULT_ROUNDS`. Validated against `MAX_ROUNDS` before any
    /// dispatch.
    pub rounds: Option<u32>,
    /// Language the personas argue in. `None` = English.
    pub language: Option<String>,
}

/// A completed round: both arguments plus the rolling summary after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateRound {
    pub round: u32,
    pub argument_a: String,
    pub argument_b: String,
    pub summary: String,
}

/// Final result handed back to the caller.
#[derive(Debug)]
pub struct DebateOutcome {
    pub id: String,
    /// Where the transcript document was persisted.
    pub location: String,
    pub rounds: Vec<DebateRound>,
    /// `None` when the debate was cancelled.
    pub verdict: Option<String>,
    pub cancelled: bool,
    /// Short human-readable result line.
    pub summary: String,
}

/// Drives the fixed-round, two-sided argumentation protocol.
pub struct DebateOrchestrator {
    dispatcher: Arc<SubagentDispatcher>,
    registry: Arc<ProviderRegistry>,
    transcripts: Arc<dyn TranscriptStore>,
}

impl DebateOrchestrator {
    pub fn new(
        dispatcher: Arc<SubagentDispatcher>,
        registry: Arc<ProviderRegistry>,
        transcripts: Arc<dyn TranscriptStore>,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            transcripts,
        }
    }

    /// Run a debate to completion, round-limit or cancellation.
    pub async fn run(
        &self,
        request: DebateRequest,
        cancel: CancelFlag,
    ) -> Result<DebateOutcome, DebateError> {
        let total_rounds = request.rounds.unwrap_or(DEFAULT_ROUNDS);
        if total_rounds == 0 || total_rounds > MAX_ROUNDS {
            return Err(DebateError::InvalidRounds(total_rounds));
        }

        // Resolve both participants up front so a bad model reference fails
        // before the first dispatch
        let resolved_a = self.registry.resolve(Some(&request.side_a.model))?;
        let resolved_b = self.registry.resolve(Some(&request.side_b.model))?;
        let language = request.language.clone().unwrap_or_else(|| "English".to_string());

        info!(
            topic = %request.topic,
            side_a = %resolved_a,
            side_b = %resolved_b,
            rounds = total_rounds,
            "debate started"
        );

        let system_a = persona_system(&request.topic, &request.side_a.stance, &language, 'A');
        let system_b = persona_system(&request.topic, &request.side_b.stance, &language, 'B');

        let mut rounds: Vec<DebateRound> = Vec::with_capacity(total_rounds as usize);
        let mut rolling_summary = String::new();
        let mut last_b_argument = String::new();
        let mut cancelled = false;

        for round in 1..=total_rounds {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let prompt_a = if round == 1 {
                format!(
                    "Open the debate on: {}\nYour position: {}\nGive your strongest opening argument.",
                    request.topic, request.side_a.stance
                )
            } else {
                format!(
                    "Debate round {}/{}.\nSummary of the debate so far:\n{}\n\nLatest argument \
                     from the other side ({}):\n{}\n\nRespond to their points and add new \
                     arguments for your position.",
                    round, total_rounds, rolling_summary, request.side_b.stance, last_b_argument
                )
            };

            let argument_a = match self
                .dispatcher
                .invoke_with(&request.side_a.model, &system_a, &prompt_a)
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(round, side = "A", error = %e, "debate round dispatch failed");
                    format!("(error: {})", e.brief())
                }
            };

            // Cancellation between the two sides drops the partial round:
            // the transcript only ever contains fully completed rounds
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let mut prompt_b = format!("Debate round {}/{}.\n", round, total_rounds);
            if !rolling_summary.is_empty() {
                prompt_b.push_str(&format!(
                    "Summary of the debate so far:\n{}\n\n",
                    rolling_summary
                ));
            }
            prompt_b.push_str(&format!(
                "Current argument from the other side ({}):\n{}\n\nRespond to their points and \
                 add arguments for your position.",
                request.side_a.stance, argument_a
            ));

            let argument_b = match self
                .dispatcher
                .invoke_with(&request.side_b.model, &system_b, &prompt_b)
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(round, side = "B", error = %e, "debate round dispatch failed");
                    format!("(error: {})", e.brief())
                }
            };

            last_b_argument = argument_b.clone();

            // Fold the round into a bounded rolling summary; size stays
            // independent of the round count
            rolling_summary = self
                .summarize(
                    &resolved_a,
                    &rolling_summary,
                    round,
                    &argument_a,
                    &argument_b,
                    &request,
                    &language,
                )
                .await;

            rounds.push(DebateRound {
                round,
                argument_a,
                argument_b,
                summary: rolling_summary.clone(),
            });
        }

        let verdict = if cancelled {
            None
        } else {
            Some(
                self.generate_verdict(&resolved_a, &request, &rounds, &rolling_summary, &language)
                    .await,
            )
        };

        let id = transcript_id(&request.topic);
        let document = render_transcript(&request, &resolved_a.to_string(), &resolved_b.to_string(), &rounds, verdict.as_deref(), cancelled);
        let location = self.transcripts.save(&id, &document).await?;

        info!(
            topic = %request.topic,
            rounds_completed = rounds.len(),
            cancelled,
            location = %location,
            "debate finished"
        );

        let summary = if cancelled {
            format!(
                "Debate cancelled after {} completed round(s). Transcript: {}",
                rounds.len(),
                location
            )
        } else {
            format!(
                "Debate finished ({} rounds). Transcript: {}",
                rounds.len(),
                location
            )
        };

        Ok(DebateOutcome {
            id,
            location,
            rounds,
            verdict,
            cancelled,
            summary,
        })
    }

    /// One summarization call covering all rounds so far. Failures degrade
    /// to an inline marker; the debate continues.
    #[allow(clippy::too_many_arguments)]
    async fn summarize(
        &self,
        summarizer: &crate::llm::ResolvedModel,
        prior_summary: &str,
        round: u32,
        argument_a: &str,
        argument_b: &str,
        request: &DebateRequest,
        language: &str,
    ) -> String {
        let system = format!(
            "You are a neutral summarizer. Summarize the debate so far concisely and \
             precisely. At most {} words. Only the summary, no preamble. Language: {}",
            SUMMARY_WORD_TARGET, language
        );
        let mut text = String::new();
        if !prior_summary.is_empty() {
            text.push_str(&format!("Summary of earlier rounds:\n{}\n\n", prior_summary));
        }
        text.push_str(&format!(
            "Round {}:\nSide A ({}): {}\nSide B ({}): {}",
            round,
            request.side_a.stance,
            excerpt(argument_a, 600),
            request.side_b.stance,
            excerpt(argument_b, 600),
        ));

        let provider = match self.registry.provider(&summarizer.provider) {
            Some(p) => p,
            None => return prior_summary.to_string(),
        };
        let req = CompletionRequest::new(vec![ChatMessage::user(text)])
            .with_system(system)
            .with_max_tokens(512);
        match provider.complete(&summarizer.model, req).await {
            Ok(response) if !response.content.trim().is_empty() => {
                response.content.trim().to_string()
            }
            Ok(_) => prior_summary.to_string(),
            Err(e) => {
                warn!(round, error = %e, "debate summary failed");
                format!("(summary unavailable: {})", e.brief())
            }
        }
    }

    /// Neutral verdict over the full transcript after the last round.
    async fn generate_verdict(
        &self,
        judge: &crate::llm::ResolvedModel,
        request: &DebateRequest,
        rounds: &[DebateRound],
        rolling_summary: &str,
        language: &str,
    ) -> String {
        let system = format!(
            "You are a neutral moderator. Summarize the debate fairly and assess the quality \
             of both sides' arguments. Language: {}",
            language
        );
        let last = rounds.last();
        let prompt = format!(
            "Summarize this debate and evaluate the arguments of both sides neutrally.\n\
             What were the strongest arguments? Where did the sides agree, where did they \
             differ?\n\nTopic: {}\nSide A ({}) vs. side B ({})\n\nDebate summary:\n{}\n\n\
             Final arguments (round {}):\nSide A: {}\nSide B: {}",
            request.topic,
            request.side_a.stance,
            request.side_b.stance,
            rolling_summary,
            last.map(|r| r.round).unwrap_or(0),
            excerpt(last.map(|r| r.argument_a.as_str()).unwrap_or(""), 800),
            excerpt(last.map(|r| r.argument_b.as_str()).unwrap_or(""), 800),
        );

        let provider = match self.registry.provider(&judge.provider) {
            Some(p) => p,
            None => return "(no verdict generated)".to_string(),
        };
        let req = CompletionRequest::new(vec![ChatMessage::user(prompt)]).with_system(system);
        match provider.complete(&judge.model, req).await {
            Ok(response) if !response.content.trim().is_empty() => {
                response.content.trim().to_string()
            }
            Ok(_) => "(no verdict generated)".to_string(),
            Err(e) => {
                warn!(error = %e, "verdict generation failed");
                format!("(verdict generation failed: {})", e.brief())
            }
        }
    }
}

fn persona_system(topic: &str, stance: &str, language: &str, side: char) -> String {
    format!(
        "You are debater {} in a structured debate.\nYour position: **{}**\nTopic: {}\n\n\
         Rules:\n\
         - Argue convincingly for your position with facts and logic\n\
         - When counterarguments are given, address them directly\n\
         - Bring at least one new argument every round\n\
         - Stay on topic\n\
         - At most 300 words per argument\n\
         - Language: {}\n\
         - Output ONLY your argument, no meta commentary like 'As debater {}...'",
        side, stance, topic, language, side
    )
}

fn transcript_id(topic: &str) -> String {
    let slug: String = topic
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug = excerpt(&slug, 40).trim_matches('-').to_string();
    let short = Uuid::new_v4().simple().to_string();
    if slug.is_empty() {
        format!("debate-{}", &short[..12])
    } else {
        format!("debate-{}-{}", slug, &short[..12])
    }
}

fn render_transcript(
    request: &DebateRequest,
    model_a: &str,
    model_b: &str,
    rounds: &[DebateRound],
    verdict: Option<&str>,
    cancelled: bool,
) -> String {
    let mut doc = format!(
        "# Debate: {}\n\n\
         - **Side A:** {} (model: `{}`)\n\
         - **Side B:** {} (model: `{}`)\n\
         - **Rounds completed:** {}\n\
         - **Date:** {}\n\n---\n\n",
        request.topic,
        request.side_a.stance,
        model_a,
        request.side_b.stance,
        model_b,
        rounds.len(),
        Utc::now().format("%Y-%m-%d %H:%M UTC"),
    );
    for round in rounds {
        doc.push_str(&format!(
            "## Round {} — Side A: {}\n\n{}\n\n## Round {} — Side B: {}\n\n{}\n\n---\n\n",
            round.round,
            request.side_a.stance,
            round.argument_a,
            round.round,
            request.side_b.stance,
            round.argument_b,
        ));
    }
    if cancelled {
        doc.push_str("*Debate cancelled; verdict omitted.*\n");
    } else if let Some(verdict) = verdict {
        doc.push_str(&format!("## Verdict\n\n{}\n", verdict));
    }
    doc
}

fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
