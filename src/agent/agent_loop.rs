//! The orchestration engine.
//!
//! One turn: lock the session (serializing all orchestration for it), append
//! the user turn, compact if the pending request exceeds the budget, run the
//! fallback chain, append and persist the reply. Scheduled jobs re-enter the
//! same path as synthetic user turns addressed to their target channel.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent::compaction::ContextCompactor;
use crate::agent::context_monitor::ContextMonitor;
use crate::agent::debate::{CancelFlag, DebateOrchestrator, DebateOutcome, DebateRequest};
use crate::agent::session::{Session, SessionManager, Turn};
use crate::agent::subagent::SubagentDispatcher;
use crate::channels::{ChannelManager, IncomingMessage, OutgoingResponse};
use crate::error::AgentError;
use crate::history::TurnLog;
use crate::llm::{
    ChainResponse, CompletionRequest, FallbackChain, ImageData, ProviderRegistry, ToolDefinition,
};
use crate::scheduler::{JobRunner, ScheduleJob};

/// Preamble prepended to scheduled-job prompts so the model knows nobody is
/// around to answer questions.
const SCHEDULE_PREAMBLE: &str = "[Scheduled task — autonomous mode] You are executing a \
     scheduled task. The user is NOT present and cannot respond. Complete the task fully on \
     your own. Never ask follow-up questions and never tell the user to do something \
     themselves. Just do it and deliver the result.";

/// Everything the engine needs, injected at construction.
pub struct AgentDeps {
    pub registry: Arc<ProviderRegistry>,
    pub chain: Arc<FallbackChain>,
    pub sessions: Arc<SessionManager>,
    pub turn_log: Arc<dyn TurnLog>,
    pub channels: Arc<ChannelManager>,
    pub subagents: Arc<SubagentDispatcher>,
    pub debates: Arc<DebateOrchestrator>,
    /// Whether delegated one-shot calls are allowed at all.
    pub subagents_enabled: bool,
    /// Share of the context window a request may occupy (0.5–0.95).
    pub context_quota: f64,
    /// Opaque policy text sent as the system prompt; never interpreted.
    pub system_prompt: String,
    /// Tool schema advertised on main-agent calls.
    pub tools: Vec<ToolDefinition>,
}

/// The conversational agent runtime core.
pub struct Agent {
    deps: AgentDeps,
}

impl Agent {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    /// Restore sessions from the turn log (process restart).
    pub async fn restore_sessions(&self) -> Result<usize, AgentError> {
        let sessions = self.deps.turn_log.load_all().await?;
        let count = sessions.len();
        for session in sessions {
            self.deps.sessions.attach(session).await;
        }
        if count > 0 {
            info!(count, "sessions restored from turn log");
        }
        Ok(count)
    }

    /// Handle one interactive user turn and produce the reply.
    pub async fn handle_message(
        &self,
        msg: IncomingMessage,
    ) -> Result<OutgoingResponse, AgentError> {
        let (handle, created) = self.deps.sessions.get_or_create(&msg.channel).await;
        // Held for the whole turn: at most one active orchestration per
        // session, turns appended in submission order
        let mut session = handle.lock().await;
        if created {
            self.deps.turn_log.create_session(&session).await?;
        }

        let user_turn = Turn::user(&msg.content);
        self.deps.turn_log.append_turn(session.id, &user_turn).await?;
        session.append(user_turn);

        let model_ref = session.model.clone();
        let chain_response = self
            .complete_for_session(&mut session, model_ref.as_deref(), &msg.images)
            .await?;

        let assistant_turn = Turn::assistant(&chain_response.response.content)
            .with_reasoning(chain_response.response.reasoning.clone())
            .with_tool_calls(chain_response.response.tool_calls.clone());
        self.deps
            .turn_log
            .append_turn(session.id, &assistant_turn)
            .await?;
        session.append(assistant_turn);

        let mut content = chain_response.response.content.clone();
        if let Some((primary, reason)) = &chain_response.switched_from {
            content.push_str(&format!(
                "\n\n_(answered by {} — {} was unavailable: {})_",
                chain_response.served_by, primary, reason
            ));
        }

        Ok(OutgoingResponse::text(content))
    }

    /// Pin a session's model selection.
    pub async fn switch_model(&self, channel: &str, model_ref: &str) -> Result<String, AgentError> {
        let resolved = self.deps.registry.resolve(Some(model_ref))?;
        let (handle, created) = self.deps.sessions.get_or_create(channel).await;
        let mut session = handle.lock().await;
        if created {
            self.deps.turn_log.create_session(&session).await?;
        }
        session.model = Some(model_ref.to_string());
        Ok(resolved.to_string())
    }

    /// Delegate a one-shot task to a subagent.
    pub async fn delegate(&self, model_ref: &str, task: &str) -> Result<String, AgentError> {
        if !self.deps.subagents_enabled {
            return Err(AgentError::SubagentsDisabled);
        }
        Ok(self.deps.subagents.invoke(model_ref, task).await?)
    }

    /// Run a structured debate between two personas.
    pub async fn debate(
        &self,
        request: DebateRequest,
        cancel: CancelFlag,
    ) -> Result<DebateOutcome, AgentError> {
        Ok(self.deps.debates.run(request, cancel).await?)
    }

    /// Build, compact if needed, and dispatch the request for the session's
    /// current state. The session lock is held by the caller.
    async fn complete_for_session(
        &self,
        session: &mut Session,
        model_ref: Option<&str>,
        images: &[ImageData],
    ) -> Result<ChainResponse, AgentError> {
        // Size against the primary backend's window; fallback candidates may
        // differ, but the budget has to be decided before dispatch
        let resolved = self.deps.registry.resolve(model_ref)?;
        let window = self.deps.registry.context_window(&resolved.provider);
        let monitor = ContextMonitor::new(window).with_quota(self.deps.context_quota);

        let mut outbound = session.outbound_messages();
        if monitor.needs_compaction(&self.deps.system_prompt, &self.deps.tools, &outbound) {
            let compactor = ContextCompactor::new(monitor.clone());
            let prior_summary = session.summary.clone();
            let active: Vec<Turn> = session.active_turns().to_vec();
            match self.deps.registry.provider(&resolved.provider) {
                Some(provider) => {
                    match compactor
                        .compact(
                            provider.as_ref(),
                            &resolved.model,
                            prior_summary.as_ref(),
                            &active,
                        )
                        .await
                    {
                        Ok(Some(compacted)) => {
                            let keep_from = compacted.keep_from;
                            session.apply_compaction(compacted.summary.clone(), keep_from);
                            self.deps
                                .turn_log
                                .append_compaction(
                                    session.id,
                                    &compacted.summary,
                                    session.superseded,
                                )
                                .await?;
                            outbound = session.outbound_messages();
                        }
                        Ok(None) => {}
                        Err(e) => {
                            // Degrade gracefully: one oversized request beats
                            // no answer
                            warn!(session = %session.id, error = %e, "compaction failed, proceeding uncompacted");
                        }
                    }
                }
                None => warn!(provider = %resolved.provider, "no adapter for compaction call"),
            }
        }

        if !images.is_empty() {
            if let Some(last) = outbound.last_mut() {
                last.images = images.to_vec();
            }
        }

        let request = CompletionRequest::new(outbound)
            .with_system(self.deps.system_prompt.clone())
            .with_tools(self.deps.tools.clone());

        Ok(self.deps.chain.complete(model_ref, request).await?)
    }
}

#[async_trait]
impl JobRunner for Agent {
    async fn run_job(&self, job: &ScheduleJob) -> Result<(), AgentError> {
        let (handle, created) = self.deps.sessions.get_or_create(&job.channel).await;
        // Taking the session lock orders this synthetic turn after any
        // interactive turns already in flight for the channel
        let mut session = handle.lock().await;
        if created {
            self.deps.turn_log.create_session(&session).await?;
        }

        let prompt = format!("{}\n\n{}", SCHEDULE_PREAMBLE, job.prompt);
        let user_turn = Turn::user(&prompt);
        self.deps.turn_log.append_turn(session.id, &user_turn).await?;
        session.append(user_turn);

        // Job's explicit model wins over the session selection
        let model_ref = job.model.clone().or_else(|| session.model.clone());
        let chain_response = self
            .complete_for_session(&mut session, model_ref.as_deref(), &[])
            .await?;

        let assistant_turn = Turn::assistant(&chain_response.response.content)
            .with_reasoning(chain_response.response.reasoning.clone());
        self.deps
            .turn_log
            .append_turn(session.id, &assistant_turn)
            .await?;
        session.append(assistant_turn);
        drop(session);

        self.deps
            .channels
            .deliver(
                &job.channel,
                OutgoingResponse::text(chain_response.response.content),
            )
            .await?;
        Ok(())
    }

    async fn report_failure(&self, job: &ScheduleJob, error: &str) {
        if let Err(e) = self
            .deps
            .channels
            .deliver(&job.channel, OutgoingResponse::text(error))
            .await
        {
            warn!(job_id = %job.id, error = %e, "could not deliver job failure report");
        }
    }
}
