use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    clients::smtp::SmtpSettings,
    mailer::SystemSender,
    models::{
        job::{Backoff, JobOptions},
        retry::RetryConfig,
    },
    queue::WorkerSettings,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        *self == Environment::Production
    }

    /// Outgoing mail gets an audit copy everywhere but on a developer box.
    pub fn keeps_audit_copy(&self) -> bool {
        *self != Environment::Development
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub app_env: Environment,

    pub mailer_domain: String,
    pub mailer_host: String,
    pub mailer_port: u16,
    pub mailer_auth_user: Option<String>,
    pub mailer_auth_pass: Option<String>,
    pub mailer_audit_bcc: Option<String>,

    #[serde(default = "default_template_root")]
    pub template_root: String,
    pub template_service_url: Option<String>,
    #[serde(default = "default_locale")]
    pub default_locale: String,

    pub redis_url: String,
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
    #[serde(default = "default_email_queue_name")]
    pub email_queue_name: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
    #[serde(default = "default_lock_duration_ms")]
    pub queue_lock_duration_ms: u64,
    #[serde(default = "default_stalled_interval_ms")]
    pub queue_stalled_interval_ms: u64,
    #[serde(default = "default_max_stalled_count")]
    pub queue_max_stalled_count: u32,

    #[serde(default = "default_job_attempts")]
    pub job_attempts: u32,
    #[serde(default = "default_job_backoff_delay_ms")]
    pub job_backoff_delay_ms: u64,
    #[serde(default = "default_job_priority")]
    pub job_priority: u32,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_template_root() -> String {
    ".".to_string()
}

fn default_locale() -> String {
    "en".to_string()
}

fn default_queue_prefix() -> String {
    "bull".to_string()
}

fn default_email_queue_name() -> String {
    "EmailQueue".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lock_duration_ms() -> u64 {
    30_000
}

fn default_stalled_interval_ms() -> u64 {
    30_000
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_job_attempts() -> u32 {
    3
}

fn default_job_backoff_delay_ms() -> u64 {
    1000
}

fn default_job_priority() -> u32 {
    1
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    2000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn environment(&self) -> Environment {
        self.app_env
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.worker_concurrency,
            poll_interval: Duration::from_millis(self.queue_poll_interval_ms),
            lock_duration: Duration::from_millis(self.queue_lock_duration_ms),
            stalled_interval: Duration::from_millis(self.queue_stalled_interval_ms),
            max_stalled_count: self.queue_max_stalled_count,
            ack_retry: self.retry_config(),
        }
    }

    /// Policy for email jobs. Finished jobs never stay in the store.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            priority: self.job_priority,
            attempts: self.job_attempts,
            backoff: Some(Backoff::Exponential {
                delay_ms: self.job_backoff_delay_ms,
            }),
            delay_ms: None,
            remove_on_complete: true,
            remove_on_fail: true,
        }
    }

    pub fn smtp_settings(&self) -> SmtpSettings {
        SmtpSettings {
            host: self.mailer_host.clone(),
            port: self.mailer_port,
            username: self.mailer_auth_user.clone(),
            password: self.mailer_auth_pass.clone(),
        }
    }

    /// The blind copy added to every message, or `None` in development.
    pub fn audit_bcc(&self) -> Option<String> {
        if !self.app_env.keeps_audit_copy() {
            return None;
        }

        Some(
            self.mailer_audit_bcc
                .clone()
                .unwrap_or_else(|| SystemSender::Storage.address(&self.mailer_domain)),
        )
    }
}
