#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use mail_dispatch::{
    clients::{smtp::MailTransport, template::TemplateRenderer},
    config::Environment,
    error::{RenderError, TransportError},
    mailer::{EmailDispatcher, Mailer, MessageComposer},
    models::{
        message::{ComposedMessage, DeliveryReceipt},
        request::{NotificationPayload, Sender, TemplateRef},
        retry::RetryConfig,
    },
    queue::{JobQueue, MemoryBackend, QueueBackend, WorkerSettings},
};
use tokio::sync::Mutex;

/// Records every message handed to it. Fails the first `failures` calls.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<ComposedMessage>>,
    pub calls: AtomicUsize,
    failures: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn deliver(&self, message: &ComposedMessage) -> Result<DeliveryReceipt, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Other(format!(
                "connection reset (call {})",
                call + 1
            )));
        }

        self.sent.lock().await.push(message.clone());

        Ok(DeliveryReceipt {
            message_id: format!("<{}@test>", call),
            accepted: message.to.clone(),
            response: "250 OK".to_string(),
        })
    }
}

/// In-process templates keyed by their `scope.name` form.
#[derive(Default)]
pub struct StaticTemplates {
    templates: BTreeMap<String, String>,
    pub renders: AtomicUsize,
}

impl StaticTemplates {
    pub fn with(mut self, template: &str, source: &str) -> Self {
        self.templates
            .insert(template.to_string(), source.to_string());
        self
    }
}

#[async_trait]
impl TemplateRenderer for StaticTemplates {
    async fn render(
        &self,
        template: &TemplateRef,
        args: &BTreeMap<String, String>,
    ) -> Result<String, RenderError> {
        self.renders.fetch_add(1, Ordering::SeqCst);

        let source = self
            .templates
            .get(&template.to_string())
            .ok_or_else(|| RenderError::NotFound(template.to_string()))?;

        mail_dispatch::clients::template::render_placeholders(source, args)
    }
}

pub fn welcome_templates() -> Arc<StaticTemplates> {
    Arc::new(
        StaticTemplates::default()
            .with("Welcome", "<p>{{isTestEmail}}</p><p>Hello {{name}}</p>")
            .with("Admin.Invite", "<p>Join us, {{name}}</p>"),
    )
}

pub fn welcome_payload() -> NotificationPayload {
    NotificationPayload::new(Sender::new("a@good.com", "A"), "Hi", "Welcome")
        .with_to("x@test.com")
        .with_arg("name", "Ada")
}

pub fn memory_queue(name: &str) -> JobQueue {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
    JobQueue::new(name, backend)
}

pub fn mailer(
    templates: Arc<StaticTemplates>,
    transport: Arc<RecordingTransport>,
    environment: Environment,
    audit_bcc: Option<&str>,
) -> Mailer {
    let composer = MessageComposer::new(templates, environment, "en");
    Mailer::new(composer, transport, audit_bcc.map(str::to_string))
}

pub fn dispatcher(
    templates: Arc<StaticTemplates>,
    transport: Arc<RecordingTransport>,
    queue: JobQueue,
) -> EmailDispatcher {
    EmailDispatcher::new(
        mailer(templates, transport, Environment::Development, None),
        queue,
        EmailDispatcher::default_job_options(),
    )
}

/// Worker settings scaled down so tests finish quickly.
pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        concurrency: 2,
        poll_interval: Duration::from_millis(10),
        lock_duration: Duration::from_secs(5),
        stalled_interval: Duration::from_millis(50),
        max_stalled_count: 1,
        ack_retry: RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 5,
            max_delay_ms: 10,
            backoff_multiplier: 2,
        },
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
