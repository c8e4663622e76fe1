use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::status::JobState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the next try, given how many attempts have already failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Largest accepted priority. The Redis backend orders waiting jobs by
/// `priority * 2^32 + id` in a double, which is exact below 2^53.
pub const MAX_PRIORITY: u32 = (1 << 21) - 1;

/// Per-job policy. Lower `priority` values are dequeued first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: u32,
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    #[serde(default)]
    pub remove_on_complete: bool,

    #[serde(default)]
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            attempts: 1,
            backoff: None,
            delay_ms: None,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.priority > MAX_PRIORITY {
            return Err(format!(
                "priority {} exceeds the maximum of {}",
                self.priority, MAX_PRIORITY
            ));
        }
        Ok(())
    }

    /// When the job should run again after `attempts_made` failed tries, or
    /// `None` once the attempt budget is spent.
    pub fn next_attempt_at(&self, attempts_made: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts_made >= self.attempts.max(1) {
            return None;
        }

        let delay = self
            .backoff
            .map(|backoff| backoff.delay_for(attempts_made))
            .unwrap_or_default();

        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

/// A job as enqueued by a producer, before the backend assigns it an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

/// What a producer gets back from `add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

/// Outcome of one sweep over expired locks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledSweep {
    pub requeued: Vec<JobId>,
    pub failed: Vec<StalledFailure>,
}

/// A job failed by the sweep because it stalled too often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledFailure {
    pub id: JobId,
    pub name: String,
    pub attempts_made: u32,
}
