use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    error::QueueError,
    models::{
        job::{JobCounts, JobId, NewJob, QueuedJob, StalledFailure, StalledSweep},
        status::JobState,
    },
    queue::backend::{QueueBackend, STALLED_REASON, deadline_after},
};

#[derive(Default)]
struct QueueState {
    last_id: u64,
    jobs: HashMap<JobId, QueuedJob>,
    waiting: BTreeSet<(u32, JobId)>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    active: HashMap<JobId, Lock>,
    /// Token of the last worker that completed or failed each job.
    settled: HashMap<JobId, String>,
}

struct Lock {
    token: String,
    expires_at: DateTime<Utc>,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(at, id)) = self.delayed.first() {
            if at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                self.waiting.insert((job.opts.priority, id));
            }
        }
    }

    fn owned_job(&mut self, id: JobId, token: &str) -> Result<&mut QueuedJob, QueueError> {
        match self.active.get(&id) {
            Some(lock) if lock.token == token => {}
            _ => return Err(QueueError::LockLost(id)),
        }
        self.active.remove(&id);
        self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))
    }

    fn settled_by(&self, id: JobId, token: &str) -> bool {
        self.settled.get(&id).is_some_and(|owner| owner == token)
    }

    fn count_in(&self, state: JobState) -> u64 {
        self.jobs.values().filter(|job| job.state == state).count() as u64
    }
}

/// Process-local backend. Same semantics as the Redis backend, but nothing
/// survives a restart; used by tests and single-process setups.
#[derive(Default)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn add(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        state.last_id += 1;
        let id = JobId(state.last_id);
        let now = Utc::now();

        let delay = job
            .opts
            .delay_ms
            .filter(|ms| *ms > 0)
            .map(|ms| deadline_after(now, Duration::from_millis(ms)));

        let job_state = match delay {
            Some(at) => {
                state.delayed.insert((at, id));
                JobState::Delayed
            }
            None => {
                state.waiting.insert((job.opts.priority, id));
                JobState::Waiting
            }
        };

        state.jobs.insert(
            id,
            QueuedJob {
                id,
                name: job.name,
                data: job.data,
                opts: job.opts,
                state: job_state,
                attempts_made: 0,
                stalled_count: 0,
                created_at: now,
                processed_at: None,
                finished_at: None,
                failed_reason: None,
            },
        );

        Ok(id)
    }

    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Utc::now();
        state.promote_due(now);

        let Some((_, id)) = state.waiting.pop_first() else {
            return Ok(None);
        };
        state.settled.remove(&id);

        state.active.insert(
            id,
            Lock {
                token: token.to_string(),
                expires_at: deadline_after(now, lock_duration),
            },
        );

        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.state = JobState::Active;
        job.processed_at = Some(now);

        Ok(Some(job.clone()))
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        lock_duration: Duration,
    ) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let lock = queues
            .get_mut(queue)
            .and_then(|state| state.active.get_mut(&id))
            .filter(|lock| lock.token == token);

        match lock {
            Some(lock) => {
                lock.expires_at = deadline_after(Utc::now(), lock_duration);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        remove: bool,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(queue).ok_or(QueueError::LockLost(id))?;
        if state.settled_by(id, token) {
            return Ok(());
        }

        let job = state.owned_job(id, token)?;
        job.state = JobState::Completed;
        job.finished_at = Some(Utc::now());

        if remove {
            state.jobs.remove(&id);
        }
        state.settled.insert(id, token.to_string());

        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
        remove: bool,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(queue).ok_or(QueueError::LockLost(id))?;
        if state.settled_by(id, token) {
            return Ok(());
        }

        let job = state.owned_job(id, token)?;
        job.attempts_made += 1;
        job.failed_reason = Some(reason.to_string());

        match retry_at {
            Some(at) => {
                job.state = JobState::Delayed;
                state.delayed.insert((at, id));
            }
            None => {
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());
                if remove {
                    state.jobs.remove(&id);
                }
            }
        }
        state.settled.insert(id, token.to_string());

        Ok(())
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledSweep, QueueError> {
        let mut queues = self.queues.lock().await;
        let mut sweep = StalledSweep::default();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(sweep);
        };

        let now = Utc::now();
        let mut expired = state
            .active
            .iter()
            .filter(|(_, lock)| lock.expires_at <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        expired.sort();

        for id in expired {
            state.active.remove(&id);
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };

            job.stalled_count += 1;
            if job.stalled_count > max_stalled_count {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.failed_reason = Some(STALLED_REASON.to_string());
                sweep.failed.push(StalledFailure {
                    id,
                    name: job.name.clone(),
                    attempts_made: job.attempts_made,
                });
                if job.opts.remove_on_fail {
                    state.jobs.remove(&id);
                }
            } else {
                job.state = JobState::Waiting;
                state.waiting.insert((job.opts.priority, id));
                sweep.requeued.push(id);
            }
        }

        Ok(sweep)
    }

    async fn get(&self, queue: &str, id: JobId) -> Result<Option<QueuedJob>, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .and_then(|state| state.jobs.get(&id))
            .cloned())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let queues = self.queues.lock().await;
        let Some(state) = queues.get(queue) else {
            return Ok(JobCounts::default());
        };

        Ok(JobCounts {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            active: state.active.len() as u64,
            completed: state.count_in(JobState::Completed),
            failed: state.count_in(JobState::Failed),
        })
    }

    async fn obliterate(&self, queue: &str, force: bool) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get(queue)
            && !force
            && !state.active.is_empty()
        {
            return Err(QueueError::ActiveJobs(queue.to_string()));
        }
        queues.remove(queue);
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
