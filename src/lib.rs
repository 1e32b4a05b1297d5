//! Steward: a personal AI assistant runtime.
//!
//! The core is an orchestration engine over interchangeable model backends:
//! provider resolution with ordered fallback, token-budget context
//! compaction, a persistent job scheduler, and subagent delegation with a
//! structured multi-round debate protocol. Chat-platform connectors, front
//! ends, and tool execution are consumed through narrow interfaces and live
//! outside this crate.

pub mod agent;
pub mod channels;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod scheduler;

pub use agent::{Agent, AgentDeps};
pub use config::Config;
pub use error::AgentError;
