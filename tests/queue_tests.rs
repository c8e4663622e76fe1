mod common;

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use mail_dispatch::{
    error::QueueError,
    models::{
        job::{Backoff, JobOptions, MAX_PRIORITY},
        status::JobState,
    },
    queue::{
        JobError, JobQueue, MemoryBackend, QueueBackend, QueueEvent, QueueRegistry, WorkerSettings,
    },
};
use serde_json::{Value, json};
use tokio::{
    sync::{Mutex, broadcast},
    time::{Instant, sleep, timeout},
};

use common::{eventually, fast_settings, memory_queue};

async fn wait_for<F>(events: &mut broadcast::Receiver<QueueEvent>, wait: Duration, pred: F) -> Result<QueueEvent>
where
    F: Fn(&QueueEvent) -> bool,
{
    timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(anyhow!("event channel closed: {}", e)),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for queue event"))?
}

fn single_slot() -> WorkerSettings {
    WorkerSettings {
        concurrency: 1,
        ..fast_settings()
    }
}

/// Test: Lower priority values are processed first, FIFO within a priority
#[tokio::test]
async fn test_priority_order() -> Result<()> {
    let queue = memory_queue("priority");

    for (label, priority) in [("low", 5), ("high-1", 1), ("mid", 3), ("high-2", 1)] {
        let opts = JobOptions {
            priority,
            ..JobOptions::default()
        };
        queue.add("Task", &json!({ "label": label }), opts).await?;
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);

    let worker = queue
        .worker(single_slot())
        .process("Task", move |job| {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().await.push(job.data["label"].as_str().unwrap_or_default().to_string());
                Ok(Value::Null)
            }
        })
        .start();

    let done = eventually(Duration::from_secs(2), || {
        let seen = Arc::clone(&seen);
        async move { seen.lock().await.len() == 4 }
    })
    .await;
    assert!(done);
    worker.close().await;

    assert_eq!(*seen.lock().await, vec!["high-1", "high-2", "mid", "low"]);
    Ok(())
}

/// Test: Failing jobs are retried with exponential backoff, then fail for good
#[tokio::test]
async fn test_exponential_backoff_until_exhausted() -> Result<()> {
    let queue = memory_queue("backoff");
    let mut events = queue.subscribe();

    let opts = JobOptions {
        priority: 1,
        attempts: 3,
        backoff: Some(Backoff::Exponential { delay_ms: 200 }),
        ..JobOptions::default()
    };
    let handle = queue.add("Task", &json!({}), opts).await?;

    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&calls);
    let start = Instant::now();

    let worker = queue
        .worker(single_slot())
        .process("Task", move |_job| {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().await.push(start.elapsed());
                Err(JobError::retryable("relay unavailable"))
            }
        })
        .start();

    let event = wait_for(&mut events, Duration::from_secs(5), QueueEvent::is_terminal_failure).await?;
    assert_eq!(
        event,
        QueueEvent::Failed {
            job_id: handle.id,
            name: "Task".into(),
            error: "relay unavailable".into(),
            attempts_made: 3,
            will_retry: false,
        }
    );

    // Nothing else should run after the job failed for good.
    sleep(Duration::from_millis(600)).await;
    worker.close().await;

    let calls = calls.lock().await;
    assert_eq!(calls.len(), 3, "handler must run exactly `attempts` times");

    let first_gap = calls[1] - calls[0];
    let second_gap = calls[2] - calls[1];
    assert!(first_gap >= Duration::from_millis(190), "first gap {:?}", first_gap);
    assert!(second_gap >= Duration::from_millis(390), "second gap {:?}", second_gap);
    assert!(second_gap < Duration::from_millis(1500), "second gap {:?}", second_gap);

    let job = queue.get_job(handle.id).await?.expect("job retained");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.failed_reason.as_deref(), Some("relay unavailable"));

    Ok(())
}

/// Test: Unrecoverable errors skip the remaining attempts
#[tokio::test]
async fn test_unrecoverable_error_is_not_retried() -> Result<()> {
    let queue = memory_queue("unrecoverable");
    let mut events = queue.subscribe();

    let opts = JobOptions {
        attempts: 5,
        ..JobOptions::default()
    };
    queue.add("Task", &json!({}), opts).await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let worker = queue
        .worker(single_slot())
        .process("Task", move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(JobError::unrecoverable("template missing")) }
        })
        .start();

    let event = wait_for(&mut events, Duration::from_secs(2), QueueEvent::is_terminal_failure).await?;
    worker.close().await;

    assert!(matches!(event, QueueEvent::Failed { attempts_made: 1, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

/// Test: Jobs without a registered handler fail immediately
#[tokio::test]
async fn test_missing_handler_fails_job() -> Result<()> {
    let queue = memory_queue("missing-handler");
    let mut events = queue.subscribe();

    let opts = JobOptions {
        attempts: 3,
        ..JobOptions::default()
    };
    queue.add("Unknown", &json!({}), opts).await?;

    let worker = queue
        .worker(single_slot())
        .process("Task", |_job| async { Ok(Value::Null) })
        .start();

    let event = wait_for(&mut events, Duration::from_secs(2), QueueEvent::is_terminal_failure).await?;
    worker.close().await;

    match event {
        QueueEvent::Failed { error, .. } => {
            assert!(error.starts_with("Missing process handler for job type"), "{}", error)
        }
        other => return Err(anyhow!("unexpected event {:?}", other)),
    }
    Ok(())
}

/// Test: A panicking handler fails the attempt without killing the worker
#[tokio::test]
async fn test_panicking_handler_is_contained() -> Result<()> {
    let queue = memory_queue("panics");
    let mut events = queue.subscribe();

    queue.add("Panic", &json!({}), JobOptions::default()).await?;
    queue.add("Task", &json!({}), JobOptions::default()).await?;

    let worker = queue
        .worker(single_slot())
        .process("Panic", |job| async move {
            if job.name == "Panic" {
                panic!("handler bug");
            }
            Ok(Value::Null)
        })
        .process("Task", |_job| async { Ok(Value::Null) })
        .start();

    wait_for(&mut events, Duration::from_secs(2), QueueEvent::is_terminal_failure).await?;
    wait_for(&mut events, Duration::from_secs(2), |e| {
        matches!(e, QueueEvent::Completed { .. })
    })
    .await?;

    worker.close().await;
    Ok(())
}

/// Test: Retention options decide whether finished jobs stay in the store
#[tokio::test]
async fn test_retention_options() -> Result<()> {
    let queue = memory_queue("retention");

    let kept = queue.add("Task", &json!({}), JobOptions::default()).await?;
    let removed = queue
        .add(
            "Task",
            &json!({}),
            JobOptions {
                remove_on_complete: true,
                ..JobOptions::default()
            },
        )
        .await?;

    let worker = queue
        .worker(single_slot())
        .process("Task", |_job| async { Ok(json!("done")) })
        .start();

    let done = eventually(Duration::from_secs(2), || {
        let queue = queue.clone();
        async move {
            queue
                .counts()
                .await
                .map(|c| c.completed == 1 && c.waiting == 0 && c.active == 0)
                .unwrap_or(false)
        }
    })
    .await;
    worker.close().await;
    assert!(done);

    assert_eq!(queue.get_job(kept.id).await?.map(|j| j.state), Some(JobState::Completed));
    assert!(queue.get_job(removed.id).await?.is_none());
    Ok(())
}

/// Test: A delayed job is not eligible before its delay elapses
#[tokio::test]
async fn test_delayed_job() -> Result<()> {
    let queue = memory_queue("delayed");
    let opts = JobOptions {
        delay_ms: Some(150),
        ..JobOptions::default()
    };
    let handle = queue.add("Task", &json!({}), opts).await?;

    assert_eq!(queue.counts().await?.delayed, 1);

    let backend = queue.backend();
    let lock = Duration::from_secs(5);
    assert!(backend.fetch_next(queue.name(), "t1", lock).await?.is_none());

    sleep(Duration::from_millis(200)).await;
    let job = backend.fetch_next(queue.name(), "t1", lock).await?;
    assert_eq!(job.map(|j| j.id), Some(handle.id));
    Ok(())
}

/// Test: A job whose worker stops acknowledging is redelivered once
#[tokio::test]
async fn test_stalled_job_is_redelivered() -> Result<()> {
    let queue = memory_queue("stalled");
    let mut events = queue.subscribe();
    let handle = queue.add("Task", &json!({}), JobOptions::default()).await?;

    // A worker that takes the job and dies without ever renewing its lock.
    let dead = queue
        .backend()
        .fetch_next(queue.name(), "dead-worker", Duration::from_millis(50))
        .await?
        .expect("job fetched");
    assert_eq!(dead.id, handle.id);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let worker = queue
        .worker(single_slot())
        .process("Task", move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Value::Null) }
        })
        .start();

    let stalled = wait_for(&mut events, Duration::from_secs(2), |e| {
        matches!(e, QueueEvent::Stalled { .. })
    })
    .await?;
    assert_eq!(stalled, QueueEvent::Stalled { job_id: handle.id });

    wait_for(&mut events, Duration::from_secs(2), |e| {
        matches!(e, QueueEvent::Completed { .. })
    })
    .await?;
    sleep(Duration::from_millis(200)).await;
    worker.close().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The dead worker's late acknowledgement is refused.
    let late = queue
        .backend()
        .complete(queue.name(), handle.id, "dead-worker", false)
        .await;
    assert!(matches!(late, Err(QueueError::LockLost(id)) if id == handle.id));
    Ok(())
}

/// Test: A job that stalls more often than allowed is failed
#[tokio::test]
async fn test_stall_limit_fails_job() -> Result<()> {
    let queue = memory_queue("stall-limit");
    let mut events = queue.subscribe();
    let handle = queue.add("Task", &json!({}), JobOptions::default()).await?;
    let short = Duration::from_millis(20);

    queue.backend().fetch_next(queue.name(), "a", short).await?;
    sleep(Duration::from_millis(40)).await;
    let sweep = queue.recover_stalled(1).await?;
    assert_eq!(sweep.requeued, vec![handle.id]);

    queue.backend().fetch_next(queue.name(), "b", short).await?;
    sleep(Duration::from_millis(40)).await;
    let sweep = queue.recover_stalled(1).await?;
    assert!(sweep.requeued.is_empty());
    assert_eq!(sweep.failed.len(), 1);

    let event = wait_for(&mut events, Duration::from_secs(1), QueueEvent::is_terminal_failure).await?;
    assert!(matches!(event, QueueEvent::Failed { error, .. } if error == "job stalled more than allowable limit"));

    let job = queue.get_job(handle.id).await?.expect("job retained");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.stalled_count, 2);
    Ok(())
}

/// Test: Concurrent workers never run the same job at the same time
#[tokio::test]
async fn test_jobs_are_mutually_exclusive_across_workers() -> Result<()> {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
    let producer = JobQueue::new("exclusive", Arc::clone(&backend));

    for n in 0..30 {
        producer.add("Task", &json!({ "n": n }), JobOptions::default()).await?;
    }

    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let processed = Arc::new(Mutex::new(Vec::new()));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..2 {
        let queue = JobQueue::new("exclusive", Arc::clone(&backend));
        let (in_flight, processed, overlaps) =
            (Arc::clone(&in_flight), Arc::clone(&processed), Arc::clone(&overlaps));

        let settings = WorkerSettings {
            concurrency: 4,
            ..fast_settings()
        };
        workers.push(
            queue
                .worker(settings)
                .process("Task", move |job| {
                    let (in_flight, processed, overlaps) =
                        (Arc::clone(&in_flight), Arc::clone(&processed), Arc::clone(&overlaps));
                    async move {
                        if !in_flight.lock().await.insert(job.id) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        sleep(Duration::from_millis(5)).await;
                        in_flight.lock().await.remove(&job.id);
                        processed.lock().await.push(job.id);
                        Ok(Value::Null)
                    }
                })
                .start(),
        );
    }

    let done = eventually(Duration::from_secs(5), || {
        let processed = Arc::clone(&processed);
        async move { processed.lock().await.len() >= 30 }
    })
    .await;
    for worker in workers {
        worker.close().await;
    }
    assert!(done);

    let processed = processed.lock().await;
    let unique: HashSet<_> = processed.iter().collect();
    assert_eq!(processed.len(), 30, "every job processed exactly once");
    assert_eq!(unique.len(), 30);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    Ok(())
}

/// Test: Obliterate refuses while jobs are active unless forced
#[tokio::test]
async fn test_obliterate() -> Result<()> {
    let queue = memory_queue("obliterate");
    for _ in 0..3 {
        queue.add("Task", &json!({}), JobOptions::default()).await?;
    }
    queue
        .backend()
        .fetch_next(queue.name(), "busy", Duration::from_secs(30))
        .await?;

    assert!(matches!(
        queue.obliterate(false).await,
        Err(QueueError::ActiveJobs(_))
    ));
    assert_eq!(queue.counts().await?.total(), 3);

    queue.obliterate(true).await?;
    assert_eq!(queue.counts().await?.total(), 0);

    queue.add("Task", &json!({}), JobOptions::default()).await?;
    assert_eq!(queue.counts().await?.waiting, 1);
    Ok(())
}

/// Test: The registry hands out one shared queue per name and closes workers
#[tokio::test]
async fn test_registry_shares_queues_and_closes_workers() -> Result<()> {
    let registry = QueueRegistry::new(Arc::new(MemoryBackend::new()));

    let producer = registry.get("EmailQueue").await;
    let consumer = registry.get("EmailQueue").await;
    let mut events = producer.subscribe();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    registry
        .run_worker(consumer.worker(single_slot()).process("Task", move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Value::Null) }
        }))
        .await;

    producer.add("Task", &json!({}), JobOptions::default()).await?;
    wait_for(&mut events, Duration::from_secs(2), |e| {
        matches!(e, QueueEvent::Completed { .. })
    })
    .await?;

    registry.close_all().await;

    producer.add("Task", &json!({}), JobOptions::default()).await?;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(producer.counts().await?.waiting, 1);
    Ok(())
}

/// Test: Priorities above the exact-score range are refused before storage
#[tokio::test]
async fn test_priority_above_cap_is_rejected() -> Result<()> {
    let queue = memory_queue("priority-cap");

    let highest = JobOptions {
        priority: MAX_PRIORITY,
        ..JobOptions::default()
    };
    queue.add("Task", &json!({}), highest).await?;

    let too_high = JobOptions {
        priority: MAX_PRIORITY + 1,
        ..JobOptions::default()
    };
    let err = queue
        .add("Task", &json!({}), too_high)
        .await
        .expect_err("priority over the cap must be refused");
    assert!(matches!(err, QueueError::InvalidOptions(_)));

    assert_eq!(queue.counts().await?.waiting, 1);
    Ok(())
}
