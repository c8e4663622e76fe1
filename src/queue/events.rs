use crate::models::job::JobId;

/// Lifecycle notifications published by a queue and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Active {
        job_id: JobId,
        name: String,
    },
    Completed {
        job_id: JobId,
        name: String,
    },
    /// An attempt failed. `will_retry` is false once the job is failed for good.
    Failed {
        job_id: JobId,
        name: String,
        error: String,
        attempts_made: u32,
        will_retry: bool,
    },
    /// A job's lock expired before it was acknowledged and it went back to
    /// waiting.
    Stalled {
        job_id: JobId,
    },
    /// Infrastructure trouble not tied to a single job.
    Error {
        message: String,
    },
}

impl QueueEvent {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            QueueEvent::Failed {
                will_retry: false,
                ..
            }
        )
    }
}
