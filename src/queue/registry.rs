use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tracing::info;

use crate::queue::{JobQueue, QueueBackend, Worker, WorkerHandle};

/// Hands out one shared [`JobQueue`] per name and owns the workers started
/// through it, so shutdown can close everything in one place.
pub struct QueueRegistry {
    backend: Arc<dyn QueueBackend>,
    queues: Mutex<HashMap<String, JobQueue>>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl QueueRegistry {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// The queue called `name`, created on first use. Repeated calls return
    /// handles sharing the same event channel.
    pub async fn get(&self, name: &str) -> JobQueue {
        let mut queues = self.queues.lock().await;

        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(queue = name, "Queue registered");
                JobQueue::new(name, Arc::clone(&self.backend))
            })
            .clone()
    }

    pub async fn run_worker(&self, worker: Worker) {
        let handle = worker.start();
        self.workers.lock().await.push(handle);
    }

    pub async fn close_all(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        let count = workers.len();

        for worker in workers {
            worker.close().await;
        }

        self.queues.lock().await.clear();
        info!(workers = count, "All queues closed");
    }
}
