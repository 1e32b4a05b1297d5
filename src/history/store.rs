//! File-backed stores under one data directory.
//!
//! Layout:
//!   `<data>/sessions/<uuid>.jsonl`  - append-only turn logs
//!   `<data>/jobs.json`              - job store, rewritten atomically
//!   `<data>/transcripts/<id>.md`    - debate transcripts
//!
//! The job file is replaced via temp file + rename so a crash between two
//! writes can never leave a half-written store; readers see either the old
//! or the new document, nothing in between.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::session::{Session, Turn};
use crate::error::StoreError;
use crate::history::{JobStore, LogRecord, TranscriptStore, TurnLog, replay_session};
use crate::scheduler::ScheduleJob;

fn write_err(what: impl Into<String>) -> impl FnOnce(std::io::Error) -> StoreError {
    let what = what.into();
    move |source| StoreError::Write { what, source }
}

fn read_err(what: impl Into<String>) -> impl FnOnce(std::io::Error) -> StoreError {
    let what = what.into();
    move |source| StoreError::Read { what, source }
}

/// Append-only JSONL turn log, one file per session.
pub struct FileTurnLog {
    dir: PathBuf,
}

impl FileTurnLog {
    /// Open (and create) the sessions directory under the data dir.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("sessions");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(write_err(format!("sessions dir {}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, session: Uuid) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session))
    }

    async fn append_record(&self, session: Uuid, record: &LogRecord) -> Result<(), StoreError> {
        let path = self.path_for(session);
        let mut line = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            what: format!("log record for {}", session),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(write_err(format!("turn log {}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(write_err(format!("turn log {}", path.display())))?;
        file.sync_data()
            .await
            .map_err(write_err(format!("turn log {}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl TurnLog for FileTurnLog {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.append_record(
            session.id,
            &LogRecord::Meta {
                session: session.id,
                channel: session.channel.clone(),
                created_at: session.created_at,
            },
        )
        .await
    }

    async fn append_turn(&self, session: Uuid, turn: &Turn) -> Result<(), StoreError> {
        self.append_record(session, &LogRecord::Turn { turn: turn.clone() })
            .await
    }

    async fn append_compaction(
        &self,
        session: Uuid,
        summary: &Turn,
        superseded: usize,
    ) -> Result<(), StoreError> {
        self.append_record(
            session,
            &LogRecord::Compaction {
                summary: summary.clone(),
                superseded,
            },
        )
        .await
    }

    async fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(read_err(format!("sessions dir {}", self.dir.display())))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(read_err("sessions dir entry"))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(read_err(format!("turn log {}", path.display())))?;

            let mut records = Vec::new();
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        // A torn final line from a crash is tolerated; the
                        // session continues from the last intact record
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "skipping unreadable log line"
                        );
                    }
                }
            }
            if let Some(session) = replay_session(records) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}

/// JSON job store with an in-memory index, rewritten atomically on change.
///
/// Writers hold the index lock across the file write so two concurrent
/// mutations can never persist out of order; readers only take it for the
/// duration of a clone.
pub struct FileJobStore {
    path: PathBuf,
    jobs: Arc<Mutex<HashMap<Uuid, ScheduleJob>>>,
}

impl FileJobStore {
    /// Open the job store, loading any existing jobs.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(write_err(format!("data dir {}", data_dir.display())))?;
        let path = data_dir.join("jobs.json");

        let jobs = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let list: Vec<ScheduleJob> =
                    serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                        what: format!("job store {}", path.display()),
                        reason: e.to_string(),
                    })?;
                list.into_iter().map(|j| (j.id, j)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(StoreError::Read {
                    what: format!("job store {}", path.display()),
                    source: e,
                });
            }
        };

        Ok(Self {
            path,
            jobs: Arc::new(Mutex::new(jobs)),
        })
    }

    /// Serialize the given snapshot and atomically replace the store file.
    async fn persist(&self, snapshot: &HashMap<Uuid, ScheduleJob>) -> Result<(), StoreError> {
        let mut list: Vec<&ScheduleJob> = snapshot.values().collect();
        list.sort_by_key(|j| j.created_at);
        let json = serde_json::to_string_pretty(&list).map_err(|e| StoreError::Corrupt {
            what: format!("job store {}", self.path.display()),
            reason: e.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(write_err(format!("job store temp {}", tmp.display())))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(write_err(format!("job store temp {}", tmp.display())))?;
        file.sync_all()
            .await
            .map_err(write_err(format!("job store temp {}", tmp.display())))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(write_err(format!("job store {}", self.path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, job: &ScheduleJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id, job.clone());
        self.persist(&jobs).await
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let existed = jobs.remove(&id).is_some();
        if existed {
            self.persist(&jobs).await?;
        }
        Ok(existed)
    }

    async fn update_last_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.last_run = Some(at);
        self.persist(&jobs).await
    }

    async fn list(&self) -> Result<Vec<ScheduleJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut list: Vec<ScheduleJob> = jobs.values().cloned().collect();
        list.sort_by_key(|j| j.created_at);
        Ok(list)
    }
}

/// Flat Markdown documents, one per debate.
pub struct FileTranscriptStore {
    dir: PathBuf,
}

impl FileTranscriptStore {
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("transcripts");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(write_err(format!("transcripts dir {}", dir.display())))?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl TranscriptStore for FileTranscriptStore {
    async fn save(&self, id: &str, document: &str) -> Result<String, StoreError> {
        let path = self.dir.join(format!("{}.md", id));
        let tmp = self.dir.join(format!("{}.md.tmp", id));
        tokio::fs::write(&tmp, document)
            .await
            .map_err(write_err(format!("transcript {}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(write_err(format!("transcript {}", path.display())))?;
        Ok(path.display().to_string())
    }
}
