mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_dispatch::{
    error::QueueError,
    models::job::{JobCounts, JobId, JobOptions, NewJob, QueuedJob, StalledSweep},
    queue::{JobError, JobQueue, MemoryBackend, QueueBackend, QueueEvent},
};
use serde_json::{Value, json};
use tokio::{sync::broadcast, time::timeout};

use common::fast_settings;

/// Applies every transition, but can drop the reply of the next `complete`
/// or `fail` after it has been stored.
#[derive(Default)]
struct DroppedReplyBackend {
    inner: MemoryBackend,
    drop_complete_reply: AtomicBool,
    drop_fail_reply: AtomicBool,
}

fn dropped(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::SeqCst)
}

#[async_trait]
impl QueueBackend for DroppedReplyBackend {
    async fn add(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError> {
        self.inner.add(queue, job).await
    }

    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        self.inner.fetch_next(queue, token, lock_duration).await
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        lock_duration: Duration,
    ) -> Result<bool, QueueError> {
        self.inner.extend_lock(queue, id, token, lock_duration).await
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        remove: bool,
    ) -> Result<(), QueueError> {
        self.inner.complete(queue, id, token, remove).await?;
        if dropped(&self.drop_complete_reply) {
            return Err(QueueError::Corrupt("connection reset before reply".into()));
        }
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
        self.inner
            .fail(queue, id, token, reason, retry_at, remove)
            .await?;
        if dropped(&self.drop_fail_reply) {
            return Err(QueueError::Corrupt("connection reset before reply".into()));
        }
        Ok(())
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledSweep, QueueError> {
        self.inner.recover_stalled(queue, max_stalled_count).await
    }

    async fn get(&self, queue: &str, id: JobId) -> Result<Option<QueuedJob>, QueueError> {
        self.inner.get(queue, id).await
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.inner.counts(queue).await
    }

    async fn obliterate(&self, queue: &str, force: bool) -> Result<(), QueueError> {
        self.inner.obliterate(queue, force).await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.inner.ping().await
    }
}

async fn next_outcome(events: &mut broadcast::Receiver<QueueEvent>) -> Result<QueueEvent> {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event @ (QueueEvent::Completed { .. } | QueueEvent::Failed { .. })) => {
                    return Ok(event);
                }
                Ok(QueueEvent::Error { message }) => {
                    return Err(anyhow!("queue error instead of an outcome: {}", message));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(anyhow!("event channel closed: {}", e)),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for job outcome"))?
}

/// Test: A final failure whose reply was lost is still published
#[tokio::test]
async fn test_lost_fail_reply_still_publishes_failure() -> Result<()> {
    let backend = Arc::new(DroppedReplyBackend::default());
    backend.drop_fail_reply.store(true, Ordering::SeqCst);
    let queue = JobQueue::new("lossy-fail", backend.clone());
    let mut events = queue.subscribe();

    let opts = JobOptions {
        attempts: 1,
        remove_on_fail: true,
        ..JobOptions::default()
    };
    let handle = queue.add("Task", &json!({}), opts).await?;

    let worker = queue
        .worker(fast_settings())
        .process("Task", |_job| async { Err(JobError::unrecoverable("bad template")) })
        .start();

    let event = next_outcome(&mut events).await?;
    worker.close().await;

    match event {
        QueueEvent::Failed {
            job_id,
            error,
            attempts_made,
            will_retry,
            ..
        } => {
            assert_eq!(job_id, handle.id);
            assert_eq!(error, "bad template");
            assert_eq!(attempts_made, 1);
            assert!(!will_retry);
        }
        other => return Err(anyhow!("unexpected event {:?}", other)),
    }
    assert!(queue.get_job(handle.id).await?.is_none());
    assert!(!backend.drop_fail_reply.load(Ordering::SeqCst), "reply was dropped once");
    Ok(())
}

/// Test: A completion whose reply was lost is still published, once
#[tokio::test]
async fn test_lost_complete_reply_still_publishes_completion() -> Result<()> {
    let backend = Arc::new(DroppedReplyBackend::default());
    backend.drop_complete_reply.store(true, Ordering::SeqCst);
    let queue = JobQueue::new("lossy-complete", backend.clone());
    let mut events = queue.subscribe();

    let opts = JobOptions {
        attempts: 3,
        remove_on_complete: true,
        ..JobOptions::default()
    };
    let handle = queue.add("Task", &json!({}), opts).await?;

    let worker = queue
        .worker(fast_settings())
        .process("Task", |_job| async { Ok(Value::Null) })
        .start();

    let event = next_outcome(&mut events).await?;
    worker.close().await;

    assert!(matches!(event, QueueEvent::Completed { job_id, .. } if job_id == handle.id));
    assert_eq!(queue.counts().await?.total(), 0);
    Ok(())
}

/// Test: Repeating a transition with the finishing token is accepted, other tokens are not
#[tokio::test]
async fn test_repeated_transition_is_accepted_for_same_token() -> Result<()> {
    let backend = MemoryBackend::new();
    let id = backend
        .add(
            "repeat",
            NewJob {
                name: "Task".into(),
                data: json!({}),
                opts: JobOptions::default(),
            },
        )
        .await?;
    backend
        .fetch_next("repeat", "owner", Duration::from_secs(30))
        .await?
        .expect("job available");

    backend.fail("repeat", id, "owner", "boom", None, false).await?;
    backend.fail("repeat", id, "owner", "boom", None, false).await?;

    let job = backend.get("repeat", id).await?.expect("failed job kept");
    assert_eq!(job.attempts_made, 1, "the repeat must not count another attempt");

    let err = backend.complete("repeat", id, "intruder", false).await.unwrap_err();
    assert!(matches!(err, QueueError::LockLost(lost) if lost == id));
    Ok(())
}
