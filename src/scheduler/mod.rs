//! Job scheduler: trigger evaluation, execution, and retry.
//!
//! A background loop polls the job store at a fixed short interval. Jobs
//! whose trigger fires within the elapsed window run as independent tasks,
//! so one hung job never delays the detection or execution of others. The
//! store is the single source of truth: a crash mid-execution leaves the job
//! pending, and triggers missed during downtime are skipped, not queued.

mod job;

pub use job::{ScheduleJob, Trigger, parse_when};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{AgentError, SchedulerError};
use crate::history::JobStore;

/// Executes a due job by re-entering the orchestration engine.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Submit the job's prompt as a synthetic user turn and deliver the
    /// result to the job's channel.
    async fn run_job(&self, job: &ScheduleJob) -> Result<(), AgentError>;

    /// Surface a terminal failure to the job's channel.
    async fn report_failure(&self, job: &ScheduleJob, error: &str);
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Evaluation cadence; must stay at or below one minute so cron
    /// triggers are detected at minute granularity.
    pub poll_interval: Duration,
    /// Upper bound for one execution attempt.
    pub attempt_timeout: Duration,
    /// Pause between a failed attempt and the single retry.
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(300),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Stores triggerable work items and executes them when due.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
    /// Jobs currently executing; keeps a still-running deadline job from
    /// firing again on the next tick.
    in_flight: Mutex<HashSet<uuid::Uuid>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn JobRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Create and durably persist a job from a trigger description.
    ///
    /// The job is acknowledged only after the store write succeeds.
    pub async fn add_job(
        &self,
        when: &str,
        prompt: impl Into<String>,
        channel: impl Into<String>,
        model: Option<String>,
        once: bool,
    ) -> Result<ScheduleJob, SchedulerError> {
        let trigger = parse_when(when, Utc::now())?;
        let job = ScheduleJob::new(trigger, prompt, channel, model, once);
        self.store.insert(&job).await?;
        info!(job = %job.describe(), "job scheduled");
        Ok(job)
    }

    /// Remove a job by id. Durable before returning.
    pub async fn remove_job(&self, id: uuid::Uuid) -> Result<bool, SchedulerError> {
        let removed = self.store.remove(id).await?;
        if removed {
            info!(job_id = %id, "job removed");
        }
        Ok(removed)
    }

    /// All stored jobs.
    pub async fn list_jobs(&self) -> Result<Vec<ScheduleJob>, SchedulerError> {
        Ok(self.store.list().await?)
    }

    /// Drop deadline jobs whose trigger time passed more than one
    /// evaluation interval ago. Missed triggers are skipped, not queued, so
    /// a restart after downtime cannot cause an execution storm.
    pub async fn cleanup_stale(&self) -> Result<usize, SchedulerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.poll_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut removed = 0;
        for job in self.store.list().await? {
            if let Trigger::At { deadline } = &job.trigger {
                if *deadline < cutoff {
                    warn!(job = %job.describe(), "removing expired one-shot job missed during downtime");
                    self.store.remove(job.id).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Evaluate which stored jobs are due in `(window_start, now]`,
    /// excluding those still executing.
    pub async fn due_jobs(
        &self,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleJob>, SchedulerError> {
        let in_flight = self.in_flight.lock().await.clone();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|job| !in_flight.contains(&job.id) && job.is_due(window_start, now))
            .collect())
    }

    /// Run one evaluation tick: spawn every due job as its own task.
    pub async fn tick(
        self: &Arc<Self>,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let due = self.due_jobs(window_start, now).await?;
        let count = due.len();
        for job in due {
            self.in_flight.lock().await.insert(job.id);
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.execute(job).await;
            });
        }
        Ok(count)
    }

    /// The background evaluation loop. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            info!("scheduler disabled, not starting loop");
            return;
        }

        match self.cleanup_stale().await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "expired one-shot jobs cleaned up at startup"),
            Err(e) => error!(error = %e, "startup cleanup failed"),
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "scheduler loop started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        // First tick completes immediately; consume it so the first window
        // starts now instead of reaching into the past
        interval.tick().await;
        let mut window_start = Utc::now();

        loop {
            interval.tick().await;
            let now = Utc::now();
            if let Err(e) = self.tick(window_start, now).await {
                error!(error = %e, "job evaluation failed");
            }
            window_start = now;
        }
    }

    /// Execute one due job: one attempt, one retry, then the terminal
    /// transition. Runs inside its own spawned task.
    async fn execute(self: &Arc<Self>, job: ScheduleJob) {
        info!(job_id = %job.id, prompt = %truncate(&job.prompt, 80), "job started");

        let first = self.attempt(&job).await;
        let outcome = match first {
            Ok(()) => Ok(()),
            Err(first_error) => {
                warn!(job_id = %job.id, error = %first_error, "job attempt failed, retrying once");
                tokio::time::sleep(self.config.retry_delay).await;
                self.attempt(&job)
                    .await
                    .map_err(|second_error| (first_error, second_error))
            }
        };

        match outcome {
            Ok(()) => {
                if job.one_shot() {
                    // REMOVED: one-shot jobs leave the store exactly once
                    if let Err(e) = self.store.remove(job.id).await {
                        error!(job_id = %job.id, error = %e, "failed to remove completed one-shot job");
                    }
                } else if let Err(e) = self.store.update_last_run(job.id, Utc::now()).await {
                    error!(job_id = %job.id, error = %e, "failed to update last-run timestamp");
                }
                info!(job_id = %job.id, "job completed");
            }
            Err((first_error, second_error)) => {
                let description = format!(
                    "attempt: {}; retry: {}",
                    first_error, second_error
                );
                if job.one_shot() {
                    // FAILED_TERMINAL: drop from the store, surface to the
                    // originating channel
                    error!(job_id = %job.id, error = %description, "one-shot job failed terminally");
                    if let Err(e) = self.store.remove(job.id).await {
                        error!(job_id = %job.id, error = %e, "failed to remove failed one-shot job");
                    }
                    self.runner
                        .report_failure(
                            &job,
                            &format!("Scheduled task failed after retry ({})", description),
                        )
                        .await;
                } else {
                    // Recurring jobs self-heal at the next natural trigger
                    warn!(job_id = %job.id, error = %description, "recurring job failed, will retry at next trigger");
                }
            }
        }

        self.in_flight.lock().await.remove(&job.id);
    }

    async fn attempt(&self, job: &ScheduleJob) -> Result<(), String> {
        match tokio::time::timeout(self.config.attempt_timeout, self.runner.run_job(job)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "execution timed out after {}s",
                self.config.attempt_timeout.as_secs()
            )),
        }
    }
}

/// Spawn the scheduler loop as a background task.
pub fn spawn_scheduler(scheduler: Arc<Scheduler>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        scheduler.run().await;
    })
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::history::memory::MemoryJobStore;

    /// Runner that records executions and fails a configurable number of
    /// times per job.
    struct ScriptedRunner {
        runs: StdMutex<Vec<uuid::Uuid>>,
        failures: StdMutex<Vec<String>>,
        fail_first: StdMutex<usize>,
        hang: bool,
    }

    impl ScriptedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: StdMutex::new(Vec::new()),
                failures: StdMutex::new(Vec::new()),
                fail_first: StdMutex::new(0),
                hang: false,
            })
        }

        fn failing_times(n: usize) -> Arc<Self> {
            let runner = Self::new();
            *runner.fail_first.lock().unwrap() = n;
            runner
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                runs: StdMutex::new(Vec::new()),
                failures: StdMutex::new(Vec::new()),
                fail_first: StdMutex::new(0),
                hang: true,
            })
        }

        fn run_count(&self) -> usize {
            self.runs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run_job(&self, job: &ScheduleJob) -> Result<(), AgentError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.runs.lock().unwrap().push(job.id);
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AgentError::Llm(crate::error::LlmError::Protocol {
                    provider: "test".to_string(),
                    reason: "scripted failure".to_string(),
                }));
            }
            Ok(())
        }

        async fn report_failure(&self, _job: &ScheduleJob, error: &str) {
            self.failures.lock().unwrap().push(error.to_string());
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            poll_interval: Duration::from_secs(30),
            attempt_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(1),
        }
    }

    async fn drain(scheduler: &Arc<Scheduler>) {
        // Let spawned job tasks finish
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if scheduler.in_flight.lock().await.is_empty() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_one_shot_fires_exactly_once_and_is_removed() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = ScriptedRunner::new();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            runner.clone(),
            config(),
        ));

        let job = scheduler
            .add_job("in 1 minute", "say hello", "cli", None, false)
            .await
            .unwrap();
        assert!(store.contains(job.id));

        let created = Utc::now();
        // Not yet due
        let fired = scheduler
            .tick(created, created + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(fired, 0);

        // Due one tick later
        let fired = scheduler
            .tick(
                created + chrono::Duration::seconds(30),
                created + chrono::Duration::seconds(61),
            )
            .await
            .unwrap();
        assert_eq!(fired, 1);
        drain(&scheduler).await;

        assert_eq!(runner.run_count(), 1);
        assert!(!store.contains(job.id), "one-shot job must leave the store");

        // Further ticks never fire it again
        let fired = scheduler
            .tick(
                created + chrono::Duration::seconds(61),
                created + chrono::Duration::seconds(120),
            )
            .await
            .unwrap();
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn test_failed_attempt_retried_once_then_success() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = ScriptedRunner::failing_times(1);
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner.clone(), config()));

        let job = scheduler
            .add_job("in 1 minute", "flaky task", "cli", None, false)
            .await
            .unwrap();

        let now = Utc::now();
        scheduler
            .tick(now, now + chrono::Duration::seconds(61))
            .await
            .unwrap();
        drain(&scheduler).await;

        // Original attempt + one retry
        assert_eq!(runner.run_count(), 2);
        assert!(!store.contains(job.id));
        assert!(runner.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_terminal_failure_reported_and_removed() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = ScriptedRunner::failing_times(2);
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner.clone(), config()));

        let job = scheduler
            .add_job("in 1 minute", "doomed task", "cli", None, false)
            .await
            .unwrap();

        let now = Utc::now();
        scheduler
            .tick(now, now + chrono::Duration::seconds(61))
            .await
            .unwrap();
        drain(&scheduler).await;

        assert_eq!(runner.run_count(), 2, "exactly one retry");
        assert!(!store.contains(job.id), "terminally failed one-shot removed");
        let failures = runner.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("after retry"));
    }

    #[tokio::test]
    async fn test_recurring_failure_returns_to_pending() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = ScriptedRunner::failing_times(2);
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner.clone(), config()));

        let job = scheduler
            .add_job("*/1 * * * *", "recurring task", "cli", None, false)
            .await
            .unwrap();

        let now = Utc::now();
        scheduler
            .tick(now - chrono::Duration::seconds(61), now)
            .await
            .unwrap();
        drain(&scheduler).await;

        assert_eq!(runner.run_count(), 2);
        // Still stored, last_run untouched: retried at the next trigger
        assert!(store.contains(job.id));
        let stored = store.list().await.unwrap();
        assert!(stored[0].last_run.is_none());
        assert!(runner.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recurring_success_advances_last_run() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = ScriptedRunner::new();
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner.clone(), config()));

        let job = scheduler
            .add_job("*/1 * * * *", "minutely", "cli", None, false)
            .await
            .unwrap();

        let now = Utc::now();
        scheduler
            .tick(now - chrono::Duration::seconds(61), now)
            .await
            .unwrap();
        drain(&scheduler).await;

        assert!(store.contains(job.id));
        let stored = store.list().await.unwrap();
        assert!(stored[0].last_run.is_some());
    }

    #[tokio::test]
    async fn test_hung_job_does_not_block_other_due_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = ScriptedRunner::hanging();
        let mut cfg = config();
        cfg.attempt_timeout = Duration::from_secs(3600);
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner.clone(), cfg));

        scheduler
            .add_job("in 1 minute", "will hang", "cli", None, false)
            .await
            .unwrap();
        scheduler
            .add_job("in 1 minute", "also due", "cli", None, false)
            .await
            .unwrap();

        let now = Utc::now();
        // Both spawn on the same tick even though neither completes
        let fired = scheduler
            .tick(now, now + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(fired, 2);

        // The next tick sees both in flight and does not double-fire
        let fired = scheduler
            .tick(
                now + chrono::Duration::seconds(61),
                now + chrono::Duration::seconds(120),
            )
            .await
            .unwrap();
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn test_execution_timeout_counts_as_failure() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = ScriptedRunner::hanging();
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner.clone(), config()));

        let job = scheduler
            .add_job("in 1 minute", "too slow", "cli", None, false)
            .await
            .unwrap();

        let now = Utc::now();
        scheduler
            .tick(now, now + chrono::Duration::seconds(61))
            .await
            .unwrap();

        // Two timeouts at 200ms each plus slack
        tokio::time::sleep(Duration::from_millis(600)).await;
        drain(&scheduler).await;

        assert!(!store.contains(job.id));
        let failures = runner.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_deadlines_only() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = ScriptedRunner::new();
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner, config()));

        // Stale: deadline far in the past (simulates downtime)
        let stale = ScheduleJob::new(
            Trigger::At {
                deadline: Utc::now() - chrono::Duration::hours(2),
            },
            "missed",
            "cli",
            None,
            true,
        );
        store.insert(&stale).await.unwrap();

        // Fresh deadline and a cron job stay
        let fresh = ScheduleJob::new(
            Trigger::At {
                deadline: Utc::now() + chrono::Duration::minutes(5),
            },
            "upcoming",
            "cli",
            None,
            true,
        );
        store.insert(&fresh).await.unwrap();
        let cron = ScheduleJob::new(
            Trigger::Cron {
                expr: "0 9 * * *".to_string(),
            },
            "daily",
            "cli",
            None,
            false,
        );
        store.insert(&cron).await.unwrap();

        let removed = scheduler.cleanup_stale().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.contains(stale.id));
        assert!(store.contains(fresh.id));
        assert!(store.contains(cron.id));
    }
}
