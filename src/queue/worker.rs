use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::{FutureExt, future::BoxFuture};
use serde_json::Value;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::QueueError,
    models::{
        job::{JobId, QueuedJob},
        retry::RetryConfig,
    },
    queue::{JobQueue, QueueEvent},
    utils::retry_with_backoff,
};

/// Why a handler gave up on an attempt.
///
/// Unrecoverable errors fail the job immediately regardless of how many
/// attempts are left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    message: String,
    retryable: bool,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::retryable(error.to_string())
    }
}

pub type JobResult = Result<Value, JobError>;

type Handler = Arc<dyn Fn(QueuedJob) -> BoxFuture<'static, JobResult> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Jobs processed at the same time by this worker.
    pub concurrency: usize,
    /// Sleep between fetches when the queue is empty.
    pub poll_interval: Duration,
    pub lock_duration: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    /// Retries for acknowledging a finished job against the backend.
    pub ack_retry: RetryConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(250),
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            ack_retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 50,
                max_delay_ms: 1000,
                backoff_multiplier: 2,
            },
        }
    }
}

/// Consumes jobs from one queue, dispatching them by job name.
pub struct Worker {
    queue: JobQueue,
    handlers: HashMap<String, Handler>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(queue: JobQueue, settings: WorkerSettings) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            settings,
        }
    }

    /// Register the handler for jobs called `name`.
    pub fn process<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(QueuedJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |job| handler(job).boxed());
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Spawn the processing slots and the stalled-job sweeper.
    pub fn start(self) -> WorkerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let concurrency = self.settings.concurrency.max(1);
        let queue_name = self.queue.name().to_string();

        info!(
            queue = %queue_name,
            concurrency,
            job_types = ?self.handlers.keys().collect::<Vec<_>>(),
            "Worker started"
        );

        let context = Arc::new(WorkerContext {
            queue: self.queue,
            handlers: self.handlers,
            settings: self.settings,
        });

        let mut tasks = Vec::with_capacity(concurrency + 1);
        for slot in 0..concurrency {
            tasks.push(tokio::spawn(run_slot(
                Arc::clone(&context),
                stop_rx.clone(),
                slot,
            )));
        }
        tasks.push(tokio::spawn(run_stalled_sweeper(context, stop_rx)));

        WorkerHandle {
            queue: queue_name,
            stop,
            tasks,
        }
    }
}

/// Running worker. Dropping the handle also stops it, without waiting.
pub struct WorkerHandle {
    queue: String,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop fetching new jobs and wait for in-flight ones to finish.
    pub async fn close(self) {
        let _ = self.stop.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(queue = %self.queue, error = %e, "Worker task ended abnormally");
            }
        }

        info!(queue = %self.queue, "Worker closed");
    }
}

struct WorkerContext {
    queue: JobQueue,
    handlers: HashMap<String, Handler>,
    settings: WorkerSettings,
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

async fn pause(stop: &mut watch::Receiver<bool>, period: Duration) {
    tokio::select! {
        _ = sleep(period) => {}
        _ = stop.changed() => {}
    }
}

async fn run_slot(context: Arc<WorkerContext>, mut stop: watch::Receiver<bool>, slot: usize) {
    let queue = context.queue.name();

    while !stopped(&stop) {
        let token = Uuid::new_v4().to_string();

        match context
            .queue
            .backend()
            .fetch_next(queue, &token, context.settings.lock_duration)
            .await
        {
            Ok(Some(job)) => context.process(job, token).await,
            Ok(None) => pause(&mut stop, context.settings.poll_interval).await,
            Err(e) => {
                error!(queue, slot, error = %e, "Failed to fetch next job");
                context.queue.emit(QueueEvent::Error {
                    message: e.to_string(),
                });
                pause(&mut stop, context.settings.poll_interval).await;
            }
        }
    }

    debug!(queue, slot, "Worker slot stopped");
}

async fn run_stalled_sweeper(context: Arc<WorkerContext>, mut stop: watch::Receiver<bool>) {
    let queue = context.queue.name();
    let mut ticker = interval(
        context
            .settings
            .stalled_interval
            .max(Duration::from_millis(1)),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !stopped(&stop) {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => continue,
        }

        if let Err(e) = context
            .queue
            .recover_stalled(context.settings.max_stalled_count)
            .await
        {
            error!(queue, error = %e, "Stalled job sweep failed");
            context.queue.emit(QueueEvent::Error {
                message: e.to_string(),
            });
        }
    }
}

impl WorkerContext {
    async fn process(&self, job: QueuedJob, token: String) {
        let queue = self.queue.name();
        let attempt = job.attempts_made + 1;

        debug!(
            queue,
            job_id = %job.id,
            job_name = %job.name,
            attempt,
            "Processing job"
        );
        self.queue.emit(QueueEvent::Active {
            job_id: job.id,
            name: job.name.clone(),
        });

        let renewal = self.spawn_lock_renewal(job.id, token.clone());

        let outcome = match self.handlers.get(&job.name) {
            // Run on its own task so a panicking handler fails the attempt
            // instead of taking the slot down.
            Some(handler) => match tokio::spawn(handler(job.clone())).await {
                Ok(result) => result,
                Err(e) => Err(JobError::retryable(format!("Job handler panicked: {}", e))),
            },
            None => Err(JobError::unrecoverable(format!(
                "Missing process handler for job type {}",
                job.name
            ))),
        };

        renewal.abort();

        match outcome {
            Ok(_) => self.acknowledge(&job, &token).await,
            Err(err) => self.record_failure(&job, &token, err).await,
        }
    }

    fn spawn_lock_renewal(&self, id: JobId, token: String) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let lock_duration = self.settings.lock_duration;

        tokio::spawn(async move {
            let mut ticker = interval((lock_duration / 2).max(Duration::from_millis(1)));
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match queue
                    .backend()
                    .extend_lock(queue.name(), id, &token, lock_duration)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(queue = queue.name(), job_id = %id, "Lost lock on active job");
                        break;
                    }
                    Err(e) => {
                        warn!(queue = queue.name(), job_id = %id, error = %e, "Failed to extend job lock");
                    }
                }
            }
        })
    }

    async fn acknowledge(&self, job: &QueuedJob, token: &str) {
        let queue = self.queue.name();
        let backend = self.queue.backend();
        let remove = job.opts.remove_on_complete;

        let result = self
            .settle(|| backend.complete(queue, job.id, token, remove))
            .await;

        match result {
            Ok(()) => {
                info!(queue, job_id = %job.id, job_name = %job.name, "Job completed");
                self.queue.emit(QueueEvent::Completed {
                    job_id: job.id,
                    name: job.name.clone(),
                });
            }
            Err(e) => self.acknowledgement_failed(job, e),
        }
    }

    async fn record_failure(&self, job: &QueuedJob, token: &str, err: JobError) {
        let queue = self.queue.name();
        let backend = self.queue.backend();
        let attempts_made = job.attempts_made + 1;

        let retry_at = if err.is_retryable() {
            job.opts.next_attempt_at(attempts_made, Utc::now())
        } else {
            None
        };

        let result = self
            .settle(|| {
                backend.fail(
                    queue,
                    job.id,
                    token,
                    err.message(),
                    retry_at,
                    job.opts.remove_on_fail,
                )
            })
            .await;

        if let Err(e) = result {
            self.acknowledgement_failed(job, e);
            return;
        }

        match retry_at {
            Some(at) => warn!(
                queue,
                job_id = %job.id,
                job_name = %job.name,
                attempts_made,
                retry_at = %at,
                error = %err,
                "Job attempt failed, retry scheduled"
            ),
            None => error!(
                queue,
                job_id = %job.id,
                job_name = %job.name,
                attempts_made,
                error = %err,
                "Job failed permanently"
            ),
        }

        self.queue.emit(QueueEvent::Failed {
            job_id: job.id,
            name: job.name.clone(),
            error: err.message().to_string(),
            attempts_made,
            will_retry: retry_at.is_some(),
        });
    }

    /// Run a completion or failure transition, retrying backend errors. The
    /// backends accept a repeat from the same token, so a retry after a lost
    /// reply is safe. A lost lock is final and not retried.
    async fn settle<F, Fut>(&self, transition: F) -> Result<(), QueueError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), QueueError>>,
    {
        retry_with_backoff(&self.settings.ack_retry, || {
            let attempt = transition();
            async move {
                match attempt.await {
                    Err(QueueError::LockLost(id)) => Ok(Err(QueueError::LockLost(id))),
                    other => other.map(Ok),
                }
            }
        })
        .await
        .and_then(|outcome| outcome)
    }

    fn acknowledgement_failed(&self, job: &QueuedJob, e: QueueError) {
        let queue = self.queue.name();

        match e {
            QueueError::LockLost(_) => {
                warn!(queue, job_id = %job.id, "Job lock lost before acknowledgement, leaving it to its new owner");
            }
            e => {
                error!(queue, job_id = %job.id, error = %e, "Failed to acknowledge job");
                self.queue.emit(QueueEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }
}
