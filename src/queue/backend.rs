use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::QueueError,
    models::job::{JobCounts, JobId, NewJob, QueuedJob, StalledSweep},
};

/// Durable store behind a [`JobQueue`](super::JobQueue).
///
/// Every state transition is a single atomic operation on the store; workers
/// never coordinate with each other directly. Ownership of an active job is
/// proven with the lock token handed to `fetch_next`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a job and return its id. Ids are unique per queue and grow
    /// with insertion order.
    async fn add(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError>;

    /// Promote due delayed jobs, then move the most urgent waiting job to
    /// active under `token` for `lock_duration`.
    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<Option<QueuedJob>, QueueError>;

    /// Push the lock expiry forward. Returns `false` when the lock was lost.
    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        lock_duration: Duration,
    ) -> Result<bool, QueueError>;

    /// Mark an active job completed. Repeating the call with the token that
    /// already completed it succeeds without changing anything, any other
    /// token gets `LockLost`.
    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        remove: bool,
    ) -> Result<(), QueueError>;

    /// Record a failed attempt. With `retry_at` the job is parked in the
    /// delayed set, otherwise it is failed for good (and dropped if `remove`).
    /// Like `complete`, a repeat with the same token is a no-op.
    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
        remove: bool,
    ) -> Result<(), QueueError>;

    /// Reclaim active jobs whose lock expired. Jobs stalled more than
    /// `max_stalled_count` times are failed instead of requeued.
    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledSweep, QueueError>;

    async fn get(&self, queue: &str, id: JobId) -> Result<Option<QueuedJob>, QueueError>;

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError>;

    /// Drop every job and all bookkeeping of a queue. Refuses while jobs are
    /// active unless `force` is set.
    async fn obliterate(&self, queue: &str, force: bool) -> Result<(), QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

pub(crate) fn deadline_after(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) const STALLED_REASON: &str = "job stalled more than allowable limit";
