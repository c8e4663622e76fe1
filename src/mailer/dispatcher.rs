use std::sync::Arc;

use serde::Serialize;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    clients::smtp::MailTransport,
    error::{DispatchError, ValidationError},
    mailer::{composer::MessageComposer, dedupe::dedupe, policy::is_blocked},
    models::{
        job::{Backoff, JobHandle, JobOptions, QueuedJob},
        message::{ComposedMessage, DeliveryReceipt},
        request::{NotificationPayload, NotificationRequest, Recipients, Sender},
        status::DispatchStage,
    },
    queue::{JobError, JobQueue, JobResult, QueueEvent, QueueRegistry, Worker, WorkerSettings},
};

pub const SEND_EMAIL_JOB: &str = "SendEmail";

/// Reject senders on a denylisted domain.
pub fn check_sender(sender: &Sender) -> Result<(), DispatchError> {
    match is_blocked(&sender.address) {
        Some(suffix) => Err(DispatchError::PolicyRejection {
            suffix: suffix.to_string(),
        }),
        None => Ok(()),
    }
}

/// The synchronous send pipeline: policy, dedupe, audit copy, compose,
/// deliver. The first failing step ends the dispatch.
pub struct Mailer {
    composer: MessageComposer,
    transport: Arc<dyn MailTransport>,
    audit_bcc: Option<String>,
}

impl Mailer {
    pub fn new(
        composer: MessageComposer,
        transport: Arc<dyn MailTransport>,
        audit_bcc: Option<String>,
    ) -> Self {
        Self {
            composer,
            transport,
            audit_bcc,
        }
    }

    pub async fn send(&self, request: &NotificationRequest) -> Result<DeliveryReceipt, DispatchError> {
        let template = request.template().to_string();

        let result = self.run(request).await;

        match &result {
            Ok(receipt) => info!(
                template = %template,
                message_id = %receipt.message_id,
                stage = %DispatchStage::Delivered,
                "Email delivered"
            ),
            Err(e) if e.is_retryable() => warn!(
                template = %template,
                stage = %e.stage(),
                error = %e,
                "Email delivery failed"
            ),
            Err(e) => error!(
                template = %template,
                stage = %e.stage(),
                error = %e,
                "Email rejected"
            ),
        }

        result
    }

    async fn run(&self, request: &NotificationRequest) -> Result<DeliveryReceipt, DispatchError> {
        check_sender(request.sender())?;
        debug!(
            stage = %DispatchStage::PolicyChecked,
            from = %request.sender().address,
            "Sender passed policy check"
        );

        let recipients = self.prepare_recipients(request.recipients());
        if recipients.to.is_empty() {
            return Err(ValidationError::NoRecipients.into());
        }

        let content = self.composer.compose(request).await?;
        debug!(stage = %DispatchStage::Composed, template = %request.template(), "Email composed");

        let message = ComposedMessage::new(
            request.sender().clone(),
            recipients,
            content,
            request.attachments().to_vec(),
        );

        Ok(self.transport.deliver(&message).await?)
    }

    /// Dedupe each list on its own, then append the audit copy to `bcc`
    /// unless it is already there.
    pub fn prepare_recipients(&self, recipients: &Recipients) -> Recipients {
        let mut bcc = dedupe(&recipients.bcc);

        if let Some(audit) = &self.audit_bcc
            && !bcc.contains(audit)
        {
            bcc.push(audit.clone());
        }

        Recipients {
            to: dedupe(&recipients.to),
            cc: dedupe(&recipients.cc),
            bcc,
        }
    }
}

/// Entry point for the rest of the application: send an email now, or
/// queue it for a background worker.
pub struct EmailDispatcher {
    mailer: Arc<Mailer>,
    queue: JobQueue,
    job_options: JobOptions,
}

impl EmailDispatcher {
    pub fn new(mailer: Mailer, queue: JobQueue, job_options: JobOptions) -> Self {
        Self {
            mailer: Arc::new(mailer),
            queue,
            job_options,
        }
    }

    /// Highest priority, three attempts with exponential backoff from one
    /// second, nothing kept once finished.
    pub fn default_job_options() -> JobOptions {
        JobOptions {
            priority: 1,
            attempts: 3,
            backoff: Some(Backoff::Exponential { delay_ms: 1000 }),
            delay_ms: None,
            remove_on_complete: true,
            remove_on_fail: true,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn mailer(&self) -> &Arc<Mailer> {
        &self.mailer
    }

    /// Validate and deliver right away. Failures are returned to the caller
    /// and never retried.
    pub async fn send_now(
        &self,
        payload: NotificationPayload,
    ) -> Result<DeliveryReceipt, DispatchError> {
        debug!(stage = %DispatchStage::Received, "Synchronous send requested");
        let request = validate(payload)?;

        self.mailer.send(&request).await
    }

    /// Validate, check the sender policy, then persist the request as a
    /// job. Nothing reaches the queue unless both checks pass.
    pub async fn enqueue(&self, payload: NotificationPayload) -> Result<JobHandle, DispatchError> {
        debug!(stage = %DispatchStage::Received, "Enqueue requested");
        let request = validate(payload)?;

        if let Err(e) = check_sender(request.sender()) {
            warn!(stage = %e.stage(), error = %e, "Email rejected before enqueue");
            return Err(e);
        }

        let data = NotificationPayload::from(&request);
        let job = self
            .queue
            .add(SEND_EMAIL_JOB, &data, self.job_options.clone())
            .await?;

        info!(
            queue = %job.queue,
            job_id = %job.id,
            template = %request.template(),
            "Email enqueued"
        );

        Ok(job)
    }

    /// Background handler: re-validate the persisted payload and run the
    /// synchronous pipeline.
    pub async fn process_job(mailer: &Mailer, job: QueuedJob) -> JobResult {
        debug!(job_id = %job.id, attempt = job.attempts_made + 1, "Processing send email job");

        let payload: NotificationPayload = serde_json::from_value(job.data)
            .map_err(|e| DispatchError::from(ValidationError::Malformed(e.to_string())))?;
        let request = validate(payload)?;

        let receipt = mailer.send(&request).await?;

        job_output(&receipt)
    }

    /// A worker bound to the email queue with the send handler registered.
    pub fn worker(&self, settings: WorkerSettings) -> Worker {
        let mailer = Arc::clone(&self.mailer);

        self.queue.worker(settings).process(SEND_EMAIL_JOB, move |job| {
            let mailer = Arc::clone(&mailer);
            async move { Self::process_job(&mailer, job).await }
        })
    }

    /// Start processing through `registry` with the event logger attached.
    pub async fn start_worker(
        &self,
        registry: &QueueRegistry,
        settings: WorkerSettings,
    ) -> JoinHandle<()> {
        let logger = spawn_event_logger(&self.queue);
        registry.run_worker(self.worker(settings)).await;
        logger
    }
}

fn validate(payload: NotificationPayload) -> Result<NotificationRequest, DispatchError> {
    match NotificationRequest::try_from(payload) {
        Ok(request) => {
            debug!(stage = %DispatchStage::Validated, template = %request.template(), "Email request valid");
            Ok(request)
        }
        Err(e) => {
            warn!(stage = %DispatchStage::Rejected, error = %e, "Invalid email request");
            Err(e.into())
        }
    }
}

/// The value a finished job reports. The email is already out at this point,
/// so a failure here must not trigger a resend.
fn job_output<T: Serialize>(value: &T) -> JobResult {
    serde_json::to_value(value).map_err(|e| {
        JobError::unrecoverable(format!("Failed to serialize job result: {}", e))
    })
}

impl From<DispatchError> for JobError {
    fn from(error: DispatchError) -> Self {
        if error.is_retryable() {
            JobError::retryable(error.to_string())
        } else {
            JobError::unrecoverable(error.to_string())
        }
    }
}

/// Log every failure, stall and infrastructure error the queue reports so
/// none of them go unnoticed.
pub fn spawn_event_logger(queue: &JobQueue) -> JoinHandle<()> {
    let mut events = queue.subscribe();
    let queue_name = queue.name().to_string();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Failed {
                    job_id,
                    name,
                    error,
                    attempts_made,
                    will_retry: false,
                }) => error!(
                    queue = %queue_name,
                    job_id = %job_id,
                    job_name = %name,
                    attempts_made,
                    stage = %DispatchStage::PermanentlyFailed,
                    error = %error,
                    "Email job permanently failed"
                ),
                Ok(QueueEvent::Failed {
                    job_id,
                    name,
                    error,
                    attempts_made,
                    will_retry: true,
                }) => warn!(
                    queue = %queue_name,
                    job_id = %job_id,
                    job_name = %name,
                    attempts_made,
                    error = %error,
                    "Email job attempt failed, will retry"
                ),
                Ok(QueueEvent::Stalled { job_id }) => {
                    warn!(queue = %queue_name, job_id = %job_id, "Queue stalled")
                }
                Ok(QueueEvent::Error { message }) => {
                    error!(queue = %queue_name, error = %message, "Queue error")
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(queue = %queue_name, skipped, "Event logger fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
