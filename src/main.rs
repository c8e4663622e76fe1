use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use mail_dispatch::{
    api::run_api_server,
    clients::{
        health::HealthChecker,
        redis::RedisClient,
        smtp::SmtpClient,
        template::{FileTemplates, TemplateRenderer, TemplateServiceClient},
    },
    config::Config,
    mailer::{EmailDispatcher, Mailer, MessageComposer},
    queue::{QueueBackend, QueueRegistry, RedisBackend},
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    info!(
        environment = ?config.environment(),
        queue = %config.email_queue_name,
        "Starting mail dispatch worker"
    );

    let redis = RedisClient::connect(&config).await?;
    let backend: Arc<dyn QueueBackend> =
        Arc::new(RedisBackend::new(&redis, config.queue_prefix.clone()));
    let registry = QueueRegistry::new(backend);
    let queue = registry.get(&config.email_queue_name).await;

    let renderer: Arc<dyn TemplateRenderer> = match &config.template_service_url {
        Some(url) => Arc::new(TemplateServiceClient::new(url, config.retry_config())?),
        None => Arc::new(FileTemplates::new(&config.template_root)),
    };
    let composer = MessageComposer::new(
        renderer,
        config.environment(),
        config.default_locale.clone(),
    );
    let transport = Arc::new(SmtpClient::new(&config.smtp_settings())?);
    let mailer = Mailer::new(composer, transport, config.audit_bcc());
    let dispatcher = EmailDispatcher::new(mailer, queue.clone(), config.job_options());

    let event_logger = dispatcher
        .start_worker(&registry, config.worker_settings())
        .await;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(run_api_server(
        config.server_port,
        HealthChecker::new(queue),
        async move {
            let _ = shutdown_rx.changed().await;
        },
    ));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received, draining workers");
        }
        result = &mut server => {
            match result {
                Ok(Err(e)) => error!(error = %e, "Health check server failed"),
                Err(e) => error!(error = %e, "Health check server task panicked"),
                Ok(Ok(())) => info!("Health check server stopped"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    registry.close_all().await;
    event_logger.abort();

    if !server.is_finished() {
        let _ = server.await;
    }

    info!("Shutdown complete");
    Ok(())
}
