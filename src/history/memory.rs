//! In-memory store implementations for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::session::{Session, Turn};
use crate::error::StoreError;
use crate::history::{JobStore, LogRecord, TranscriptStore, TurnLog, replay_session};
use crate::scheduler::ScheduleJob;

/// In-memory turn log.
#[derive(Default)]
pub struct MemoryTurnLog {
    records: Mutex<HashMap<Uuid, Vec<LogRecord>>>,
}

impl MemoryTurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records logged for a session.
    pub fn record_count(&self, session: Uuid) -> usize {
        self.records
            .lock()
            .unwrap()
            .get(&session)
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TurnLog for MemoryTurnLog {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.records.lock().unwrap().insert(
            session.id,
            vec![LogRecord::Meta {
                session: session.id,
                channel: session.channel.clone(),
                created_at: session.created_at,
            }],
        );
        Ok(())
    }

    async fn append_turn(&self, session: Uuid, turn: &Turn) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .entry(session)
            .or_default()
            .push(LogRecord::Turn { turn: turn.clone() });
        Ok(())
    }

    async fn append_compaction(
        &self,
        session: Uuid,
        summary: &Turn,
        superseded: usize,
    ) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .entry(session)
            .or_default()
            .push(LogRecord::Compaction {
                summary: summary.clone(),
                superseded,
            });
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .cloned()
            .filter_map(replay_session)
            .collect())
    }
}

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, ScheduleJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.jobs.lock().unwrap().contains_key(&id)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &ScheduleJob) -> Result<(), StoreError> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().unwrap().remove(&id).is_some())
    }

    async fn update_last_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.last_run = Some(at);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ScheduleJob>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut list: Vec<ScheduleJob> = jobs.values().cloned().collect();
        list.sort_by_key(|j| j.created_at);
        Ok(list)
    }
}

/// In-memory transcript store.
#[derive(Default)]
pub struct MemoryTranscriptStore {
    documents: Mutex<HashMap<String, String>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.documents.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn save(&self, id: &str, document: &str) -> Result<String, StoreError> {
        self.documents
            .lock()
            .unwrap()
            .insert(id.to_string(), document.to_string());
        Ok(format!("memory://{}", id))
    }
}
