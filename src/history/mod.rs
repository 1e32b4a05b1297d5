//! Persistence boundary: turn logs, the job store, and debate transcripts.
//!
//! Three narrow async traits. The file-backed implementations in `store`
//! keep everything under one data directory; `memory` provides in-process
//! implementations for tests. All writes are atomic with respect to
//! concurrent readers, and every create/remove is durable before it is
//! acknowledged to the caller.

pub mod memory;
mod store;

pub use store::{FileJobStore, FileTranscriptStore, FileTurnLog};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::session::{Session, Turn};
use crate::error::StoreError;
use crate::scheduler::ScheduleJob;

/// One record in a session's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    /// First record of every log: session identity.
    Meta {
        session: Uuid,
        channel: String,
        created_at: DateTime<Utc>,
    },
    /// An appended turn.
    Turn { turn: Turn },
    /// A compaction: summary turn plus the new superseded watermark.
    /// Earlier turn records are retained, only excluded from future
    /// outbound requests.
    Compaction { summary: Turn, superseded: usize },
}

/// Append-only per-session turn log.
#[async_trait]
pub trait TurnLog: Send + Sync {
    /// Write the meta record for a new session.
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Append one turn.
    async fn append_turn(&self, session: Uuid, turn: &Turn) -> Result<(), StoreError>;

    /// Append a compaction marker.
    async fn append_compaction(
        &self,
        session: Uuid,
        summary: &Turn,
        superseded: usize,
    ) -> Result<(), StoreError>;

    /// Replay all logs into sessions (process restart).
    async fn load_all(&self) -> Result<Vec<Session>, StoreError>;
}

/// Key-value job store, keyed by job id. The store is the single source of
/// truth for scheduled work.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Durable before this returns.
    async fn insert(&self, job: &ScheduleJob) -> Result<(), StoreError>;

    /// Remove a job. Returns whether it existed. Durable before this
    /// returns.
    async fn remove(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Atomically update the last-run timestamp of a recurring job.
    async fn update_last_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// All stored jobs.
    async fn list(&self) -> Result<Vec<ScheduleJob>, StoreError>;
}

/// Flat-document store for debate transcripts, keyed by generated id.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Persist a document, returning its location (path or key).
    async fn save(&self, id: &str, document: &str) -> Result<String, StoreError>;
}

/// Rebuild a session from its replayed log records.
pub(crate) fn replay_session(records: Vec<LogRecord>) -> Option<Session> {
    let mut iter = records.into_iter();
    let (id, channel, created_at) = match iter.next()? {
        LogRecord::Meta {
            session,
            channel,
            created_at,
        } => (session, channel, created_at),
        _ => return None,
    };

    let mut session = Session::new(channel);
    session.id = id;
    session.created_at = created_at;
    session.last_active_at = created_at;

    for record in iter {
        match record {
            LogRecord::Meta { .. } => {}
            LogRecord::Turn { turn } => session.append(turn),
            LogRecord::Compaction {
                summary,
                superseded,
            } => {
                // The stored watermark is absolute; apply_compaction takes a
                // relative index into the active view
                let keep_from = superseded.saturating_sub(session.superseded);
                session.apply_compaction(summary, keep_from);
            }
        }
    }
    Some(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_reconstructs_watermark() {
        let mut original = Session::new("cli");
        let id = original.id;
        let mut records = vec![LogRecord::Meta {
            session: id,
            channel: "cli".to_string(),
            created_at: original.created_at,
        }];
        for i in 0..6 {
            let turn = Turn::user(format!("turn {}", i));
            original.append(turn.clone());
            records.push(LogRecord::Turn { turn });
        }
        let summary = Turn::summary("digest");
        original.apply_compaction(summary.clone(), 4);
        records.push(LogRecord::Compaction {
            summary,
            superseded: 4,
        });

        let replayed = replay_session(records).unwrap();
        assert_eq!(replayed.id, id);
        assert_eq!(replayed.turns.len(), 6);
        assert_eq!(replayed.superseded, original.superseded);
        assert_eq!(replayed.active_turns().len(), 2);
        assert!(replayed.summary.is_some());
    }

    #[test]
    fn test_replay_without_meta_is_rejected() {
        let records = vec![LogRecord::Turn {
            turn: Turn::user("orphan"),
        }];
        assert!(replay_session(records).is_none());
    }
}
