//! The orchestration engine core.
//!
//! - Session/turn state with per-session serialization
//! - Context monitoring and token-budget compaction
//! - Subagent dispatch and the debate state machine
//! - The agent loop tying them to the fallback chain and channels

mod agent_loop;
pub mod compaction;
pub mod context_monitor;
pub mod debate;
pub mod session;
pub mod subagent;

pub use agent_loop::{Agent, AgentDeps};
pub use compaction::{Compacted, ContextCompactor};
pub use context_monitor::{ContextBreakdown, ContextMonitor};
pub use debate::{
    CancelFlag, DebateOrchestrator, DebateOutcome, DebatePersona, DebateRequest, DebateRound,
};
pub use session::{Session, SessionManager, Turn};
pub use subagent::{SUBAGENT_TOOL_ALLOWLIST, SubagentDispatcher};
