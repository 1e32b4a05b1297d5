//! Schedule jobs and their triggers.
//!
//! A trigger is either a standard 5-field cron expression (evaluated at
//! minute granularity in the system's local time zone) or an absolute
//! deadline derived from a relative delay (`in N minutes` / `in N hours`).
//! Relative triggers are always one-shot, whatever the `once` flag says.

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use cron::Schedule;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;

/// The condition that makes a job due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Standard 5-field cron expression (minute hour dom month dow).
    Cron { expr: String },
    /// One-shot absolute deadline.
    At { deadline: DateTime<Utc> },
}

impl Trigger {
    /// Parse the cron expression. Only valid for `Cron` triggers; the
    /// expression was validated at creation, so this only fails on a
    /// hand-edited store.
    pub fn schedule(&self) -> Option<Schedule> {
        match self {
            // The cron crate wants a seconds field; pin it to zero so the
            // 5-field expression keeps minute granularity
            Trigger::Cron { expr } => Schedule::from_str(&format!("0 {}", expr)).ok(),
            Trigger::At { .. } => None,
        }
    }
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJob {
    pub id: Uuid,
    pub trigger: Trigger,
    /// Natural-language prompt submitted as a synthetic user turn.
    pub prompt: String,
    /// Target channel the result is delivered to.
    pub channel: String,
    /// Explicit model reference; `None` = the channel's current default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Remove after the first execution.
    pub once: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

impl ScheduleJob {
    pub fn new(
        trigger: Trigger,
        prompt: impl Into<String>,
        channel: impl Into<String>,
        model: Option<String>,
        once: bool,
    ) -> Self {
        // A deadline trigger fires once by definition
        let once = once || matches!(trigger, Trigger::At { .. });
        Self {
            id: Uuid::new_v4(),
            trigger,
            prompt: prompt.into(),
            channel: channel.into(),
            model,
            once,
            created_at: Utc::now(),
            last_run: None,
        }
    }

    /// Whether this job leaves the store after one execution.
    pub fn one_shot(&self) -> bool {
        self.once || matches!(self.trigger, Trigger::At { .. })
    }

    /// Whether the trigger fires within `(window_start, now]`.
    ///
    /// Cron expressions are evaluated in local time. Deadlines simply need
    /// to have arrived: a deadline is removed after firing, and stale
    /// deadlines are purged at startup, so this cannot double-fire.
    pub fn is_due(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match &self.trigger {
            Trigger::Cron { .. } => {
                let Some(schedule) = self.trigger.schedule() else {
                    return false;
                };
                let start_local = window_start.with_timezone(&Local);
                let now_local = now.with_timezone(&Local);
                schedule
                    .after(&start_local)
                    .next()
                    .is_some_and(|occurrence| occurrence <= now_local)
            }
            Trigger::At { deadline } => *deadline <= now,
        }
    }

    /// One-line description for listings and logs.
    pub fn describe(&self) -> String {
        let when = match &self.trigger {
            Trigger::Cron { expr } => format!("cron '{}'", expr),
            Trigger::At { deadline } => format!("at {}", deadline.format("%Y-%m-%d %H:%M UTC")),
        };
        let mut parts = vec![
            format!("{}", &self.id.to_string()[..8]),
            when,
            format!("prompt: {}", excerpt(&self.prompt, 60)),
            format!("-> {}", self.channel),
        ];
        if let Some(model) = &self.model {
            parts.push(format!("model={}", model));
        }
        if self.one_shot() {
            parts.push("one-shot".to_string());
        }
        parts.join(", ")
    }
}

fn relative_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^in\s+(\d+)\s*(minute|hour)s?$").unwrap())
}

/// Parse a trigger description: a 5-field cron expression or a relative
/// delay like `in 30 minutes` / `in 1 hour`.
pub fn parse_when(input: &str, now: DateTime<Utc>) -> Result<Trigger, SchedulerError> {
    let input = input.trim();

    if let Some(captures) = relative_regex().captures(input) {
        let amount: i64 = captures[1].parse().map_err(|_| SchedulerError::InvalidTrigger {
            input: input.to_string(),
            reason: "delay amount out of range".to_string(),
        })?;
        if amount == 0 {
            return Err(SchedulerError::InvalidTrigger {
                input: input.to_string(),
                reason: "delay must be at least 1".to_string(),
            });
        }
        let delta = if captures[2].eq_ignore_ascii_case("hour") {
            ChronoDuration::hours(amount)
        } else {
            ChronoDuration::minutes(amount)
        };
        return Ok(Trigger::At {
            deadline: now + delta,
        });
    }

    let fields: Vec<&str> = input.split_whitespace().collect();
    if fields.len() == 5 {
        let expr = fields.join(" ");
        return match Schedule::from_str(&format!("0 {}", expr)) {
            Ok(_) => Ok(Trigger::Cron { expr }),
            Err(e) => Err(SchedulerError::InvalidTrigger {
                input: input.to_string(),
                reason: e.to_string(),
            }),
        };
    }

    Err(SchedulerError::InvalidTrigger {
        input: input.to_string(),
        reason: "expected a 5-field cron expression or 'in N minutes' / 'in N hours'"
            .to_string(),
    })
}

fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_relative_minutes() {
        let now = Utc::now();
        let trigger = parse_when("in 30 minutes", now).unwrap();
        match trigger {
            Trigger::At { deadline } => {
                assert_eq!((deadline - now).num_minutes(), 30);
            }
            other => panic!("expected At, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_relative_hour_singular_case_insensitive() {
        let now = Utc::now();
        let trigger = parse_when("IN 1 HOUR", now).unwrap();
        match trigger {
            Trigger::At { deadline } => {
                assert_eq!((deadline - now).num_hours(), 1);
            }
            other => panic!("expected At, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_cron_five_fields() {
        let trigger = parse_when("0 9 * * *", Utc::now()).unwrap();
        assert_eq!(
            trigger,
            Trigger::Cron {
                expr: "0 9 * * *".to_string()
            }
        );
        assert!(trigger.schedule().is_some());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_when("whenever", Utc::now()).is_err());
        assert!(parse_when("0 9 * *", Utc::now()).is_err());
        assert!(parse_when("99 99 * * *", Utc::now()).is_err());
        assert!(parse_when("in 0 minutes", Utc::now()).is_err());
    }

    #[test]
    fn test_relative_trigger_is_always_one_shot() {
        let trigger = parse_when("in 5 minutes", Utc::now()).unwrap();
        let job = ScheduleJob::new(trigger, "p", "cli", None, false);
        assert!(job.one_shot());
        assert!(job.once);
    }

    #[test]
    fn test_cron_due_within_window() {
        // 09:00 local today
        let nine = Local::now()
            .date_naive()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let nine = Local.from_local_datetime(&nine).unwrap().with_timezone(&Utc);

        let job = ScheduleJob::new(
            Trigger::Cron {
                expr: "0 9 * * *".to_string(),
            },
            "p",
            "cli",
            None,
            false,
        );

        // Window straddling 09:00 -> due
        let before = nine - ChronoDuration::seconds(30);
        let after = nine + ChronoDuration::seconds(15);
        assert!(job.is_due(before, after));

        // Window entirely before -> not due
        assert!(!job.is_due(nine - ChronoDuration::minutes(5), before));

        // Window entirely after -> not due until tomorrow
        assert!(!job.is_due(after, after + ChronoDuration::minutes(30)));
    }

    #[test]
    fn test_cron_fires_once_per_day_under_polling() {
        // Slide a 30-second evaluation window over a whole day and count
        // how often "0 9 * * *" comes up due
        let midnight = Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let midnight = Local
            .from_local_datetime(&midnight)
            .unwrap()
            .with_timezone(&Utc);

        let job = ScheduleJob::new(
            Trigger::Cron {
                expr: "0 9 * * *".to_string(),
            },
            "p",
            "cli",
            None,
            false,
        );

        let step = ChronoDuration::seconds(30);
        let mut window_start = midnight;
        let mut fired = 0;
        for _ in 0..(24 * 60 * 2) {
            let now = window_start + step;
            if job.is_due(window_start, now) {
                fired += 1;
            }
            window_start = now;
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_deadline_due_after_arrival() {
        let now = Utc::now();
        let job = ScheduleJob::new(
            Trigger::At {
                deadline: now + ChronoDuration::minutes(1),
            },
            "p",
            "cli",
            None,
            false,
        );
        assert!(!job.is_due(now - ChronoDuration::seconds(30), now));
        let later = now + ChronoDuration::seconds(61);
        assert!(job.is_due(now, later));
    }

    #[test]
    fn test_describe_mentions_model_and_one_shot() {
        let job = ScheduleJob::new(
            Trigger::At {
                deadline: Utc::now(),
            },
            "run the nightly report",
            "telegram",
            Some("cloud/smart".to_string()),
            false,
        );
        let text = job.describe();
        assert!(text.contains("model=cloud/smart"));
        assert!(text.contains("one-shot"));
        assert!(text.contains("-> telegram"));
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let job = ScheduleJob::new(
            Trigger::Cron {
                expr: "*/5 * * * *".to_string(),
            },
            "poll feeds",
            "matrix",
            None,
            true,
        );
        let json = serde_json::to_string(&job).unwrap();
        let back: ScheduleJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.trigger, job.trigger);
        assert!(back.once);
    }
}
