use thiserror::Error;

use crate::models::{job::JobId, status::DispatchStage};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Email must have a from, name, subject, and template in order to send (missing {0})")]
    MissingField(&'static str),

    #[error("Email must be sent to at least one recipient")]
    NoRecipients,

    #[error("Invalid email address in {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("Template argument '{0}' must be a string")]
    NonStringArgument(String),

    #[error("Invalid template identifier '{0}'")]
    InvalidTemplate(String),

    #[error("Malformed notification payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Missing variable in template: {0}")]
    MissingVariable(String),

    #[error("Template source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport configuration error: {0}")]
    Configuration(String),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Delivery failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock for job {0} is no longer held by this worker")]
    LockLost(JobId),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Cannot obliterate queue '{0}' while jobs are active")]
    ActiveJobs(String),

    #[error("Corrupt job record: {0}")]
    Corrupt(String),

    #[error("Invalid job options: {0}")]
    InvalidOptions(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Cannot send an email from a \"{suffix}\" domain because it violates the DMARC policy")]
    PolicyRejection { suffix: String },

    #[error("Template render failed: {0}")]
    TemplateRender(#[from] RenderError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Queue unavailable: {0}")]
    Queue(#[from] QueueError),
}

impl DispatchError {
    /// Transient infrastructure trouble is worth another attempt. Everything
    /// else reproduces deterministically from the same payload.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Transport(TransportError::Smtp(_) | TransportError::Other(_)) => true,
            DispatchError::TemplateRender(RenderError::Unavailable(_)) => true,
            DispatchError::Queue(QueueError::InvalidOptions(_)) => false,
            DispatchError::Queue(_) => true,
            _ => false,
        }
    }

    pub fn stage(&self) -> DispatchStage {
        match self {
            DispatchError::Transport(_) | DispatchError::Queue(_) => DispatchStage::DeliveryFailed,
            DispatchError::TemplateRender(RenderError::Unavailable(_)) => {
                DispatchStage::DeliveryFailed
            }
            _ => DispatchStage::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(DispatchError::from(TransportError::Other("timeout".into())).is_retryable());
        assert!(DispatchError::from(RenderError::Unavailable("503".into())).is_retryable());

        assert!(!DispatchError::from(ValidationError::NoRecipients).is_retryable());
        assert!(!DispatchError::from(RenderError::MissingVariable("name".into())).is_retryable());
        assert!(!DispatchError::from(TransportError::InvalidMessage("bad".into())).is_retryable());
        assert!(!DispatchError::from(QueueError::InvalidOptions("priority".into())).is_retryable());
        assert!(
            !DispatchError::PolicyRejection {
                suffix: "@yahoo.com".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn policy_rejection_names_the_suffix() {
        let err = DispatchError::PolicyRejection {
            suffix: "@yahoo.com".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot send an email from a \"@yahoo.com\" domain because it violates the DMARC policy"
        );
        assert_eq!(err.stage(), DispatchStage::Rejected);
    }
}
