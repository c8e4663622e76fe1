pub mod backend;
pub mod events;
pub mod memory;
pub mod redis;
pub mod registry;
pub mod worker;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    error::QueueError,
    models::job::{JobCounts, JobHandle, JobId, JobOptions, NewJob, QueuedJob, StalledSweep},
};

pub use backend::QueueBackend;
pub use events::QueueEvent;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use registry::QueueRegistry;
pub use worker::{JobError, JobResult, Worker, WorkerHandle, WorkerSettings};

const EVENT_CAPACITY: usize = 1024;

/// A named queue on top of a shared backend.
///
/// Cloning is cheap and every clone publishes to the same event channel.
#[derive(Clone)]
pub struct JobQueue {
    name: Arc<str>,
    backend: Arc<dyn QueueBackend>,
    events: broadcast::Sender<QueueEvent>,
}

impl JobQueue {
    pub fn new(name: &str, backend: Arc<dyn QueueBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            name: Arc::from(name),
            backend,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Persist a job. The payload is stored as JSON, so whatever the worker
    /// later sees is exactly what was serialized here.
    pub async fn add<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        opts: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        opts.validate().map_err(QueueError::InvalidOptions)?;

        let job = NewJob {
            name: name.to_string(),
            data: serde_json::to_value(data)?,
            opts,
        };

        match self.backend.add(&self.name, job).await {
            Ok(id) => {
                debug!(queue = %self.name, job_id = %id, job_name = name, "Job added");
                Ok(JobHandle {
                    id,
                    queue: self.name.to_string(),
                    name: name.to_string(),
                })
            }
            Err(e) => {
                error!(queue = %self.name, job_name = name, error = %e, "Failed to add job");
                self.emit(QueueEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn worker(&self, settings: WorkerSettings) -> Worker {
        Worker::new(self.clone(), settings)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<QueuedJob>, QueueError> {
        self.backend.get(&self.name, id).await
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        self.backend.counts(&self.name).await
    }

    /// Remove every job and all bookkeeping of this queue.
    pub async fn obliterate(&self, force: bool) -> Result<(), QueueError> {
        self.backend.obliterate(&self.name, force).await?;
        info!(queue = %self.name, force, "Queue obliterated");
        Ok(())
    }

    /// Reclaim jobs whose worker stopped renewing its lock.
    pub async fn recover_stalled(&self, max_stalled_count: u32) -> Result<StalledSweep, QueueError> {
        let sweep = self
            .backend
            .recover_stalled(&self.name, max_stalled_count)
            .await?;

        for id in &sweep.requeued {
            warn!(queue = %self.name, job_id = %id, "Job stalled, moved back to waiting");
            self.emit(QueueEvent::Stalled { job_id: *id });
        }

        for failure in &sweep.failed {
            error!(
                queue = %self.name,
                job_id = %failure.id,
                job_name = %failure.name,
                "Job stalled too many times, marked as failed"
            );
            self.emit(QueueEvent::Stalled { job_id: failure.id });
            self.emit(QueueEvent::Failed {
                job_id: failure.id,
                name: failure.name.clone(),
                error: backend::STALLED_REASON.to_string(),
                attempts_made: failure.attempts_made,
                will_retry: false,
            });
        }

        Ok(sweep)
    }
}
