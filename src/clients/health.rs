use std::{collections::HashMap, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    models::health::{HealthCheckResponse, HealthStatus, ServiceHealth},
    queue::JobQueue,
};

/// Failed jobs above this count mark the queue as degraded. Only reachable
/// for queues that keep failed jobs around.
const FAILED_JOBS_THRESHOLD: u64 = 100;

pub struct HealthChecker {
    queue: JobQueue,
}

impl HealthChecker {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("queue_backend".to_string(), self.check_backend().await);
        checks.insert(self.queue.name().to_string(), self.check_queue().await);

        let status = determine_overall_status(&checks);

        HealthCheckResponse {
            status,
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_backend(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.queue.backend().ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Queue backend health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Queue backend ping failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    async fn check_queue(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.queue.counts().await {
            Ok(counts) if counts.failed > FAILED_JOBS_THRESHOLD => {
                warn!(queue = self.queue.name(), failed = counts.failed, "Failed jobs piling up");
                ServiceHealth::degraded(counts, format!("{} failed jobs", counts.failed))
            }
            Ok(counts) => {
                ServiceHealth::healthy(start.elapsed().as_millis() as u64).with_jobs(counts)
            }
            Err(e) => {
                warn!(queue = self.queue.name(), error = %e, "Failed to read queue counts");
                ServiceHealth::unhealthy(format!("Cannot read job counts: {}", e))
            }
        }
    }
}

fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let has_unhealthy = checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy);

    let has_degraded = checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded);

    if has_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        models::job::JobOptions,
        queue::{MemoryBackend, QueueBackend},
    };

    #[tokio::test]
    async fn reports_counts_for_reachable_queue() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
        let queue = JobQueue::new("EmailQueue", backend);
        queue
            .add("SendEmail", &serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();

        let response = HealthChecker::new(queue).check_all().await;

        assert_eq!(response.status, HealthStatus::Healthy);
        let jobs = response.checks["EmailQueue"].jobs.unwrap();
        assert_eq!(jobs.waiting, 1);
        assert!(response.checks.contains_key("queue_backend"));
    }
}
