use async_trait::async_trait;
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Attachment as AttachmentPart, Mailbox, MultiPart, header::ContentType},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::TransportError,
    models::message::{ComposedMessage, DeliveryReceipt},
};

/// Hands a composed message to the outside world.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: &ComposedMessage) -> Result<DeliveryReceipt, TransportError>;
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SmtpSettings {
    /// Port 465 speaks TLS from the first byte; anything else upgrades with
    /// STARTTLS when the relay offers it.
    pub fn implicit_tls(&self) -> bool {
        self.port == 465
    }
}

pub struct SmtpClient {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpClient {
    pub fn new(settings: &SmtpSettings) -> Result<Self, TransportError> {
        let tls_parameters = TlsParameters::new(settings.host.clone())?;
        let tls = if settings.implicit_tls() {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Opportunistic(tls_parameters)
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
            .port(settings.port)
            .tls(tls);

        match (&settings.username, &settings.password) {
            (Some(user), Some(pass)) => {
                builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
            }
            (None, None) => {}
            _ => {
                return Err(TransportError::Configuration(
                    "SMTP username and password must be set together".to_string(),
                ));
            }
        }

        info!(
            host = %settings.host,
            port = settings.port,
            implicit_tls = settings.implicit_tls(),
            "SMTP client initialized"
        );

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpClient {
    async fn deliver(&self, message: &ComposedMessage) -> Result<DeliveryReceipt, TransportError> {
        let (email, message_id) = build_message(message)?;

        debug!(
            message_id = %message_id,
            recipients = message.recipient_count(),
            "Handing message to SMTP relay"
        );

        let response = self.transport.send(email).await?;

        Ok(DeliveryReceipt {
            message_id,
            accepted: message
                .to
                .iter()
                .chain(&message.cc)
                .chain(&message.bcc)
                .cloned()
                .collect(),
            response: response.message().collect::<Vec<_>>().join(" "),
        })
    }
}

fn parse_address(value: &str) -> Result<Address, TransportError> {
    value
        .parse::<Address>()
        .map_err(|e| TransportError::InvalidMessage(format!("invalid address {}: {}", value, e)))
}

/// Build the MIME message: a text/html alternative, wrapped in a mixed part
/// when there are attachments.
pub(crate) fn build_message(message: &ComposedMessage) -> Result<(Message, String), TransportError> {
    let from_address = parse_address(&message.from.address)?;
    let message_id = format!("<{}@{}>", Uuid::new_v4(), from_address.domain());

    let mut builder = Message::builder()
        .from(Mailbox::new(Some(message.from.name.clone()), from_address))
        .subject(message.subject.as_str())
        .message_id(Some(message_id.clone()));

    for to in &message.to {
        builder = builder.to(Mailbox::new(None, parse_address(to)?));
    }
    for cc in &message.cc {
        builder = builder.cc(Mailbox::new(None, parse_address(cc)?));
    }
    for bcc in &message.bcc {
        builder = builder.bcc(Mailbox::new(None, parse_address(bcc)?));
    }

    let body = MultiPart::alternative_plain_html(message.text.clone(), message.html.clone());

    let email = if message.attachments.is_empty() {
        builder.multipart(body)
    } else {
        let mut mixed = MultiPart::mixed().multipart(body);
        for attachment in &message.attachments {
            let content_type = attachment
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            let content_type = ContentType::parse(content_type).map_err(|e| {
                TransportError::InvalidMessage(format!(
                    "invalid content type for {}: {}",
                    attachment.filename, e
                ))
            })?;

            mixed = mixed.singlepart(
                AttachmentPart::new(attachment.filename.clone())
                    .body(attachment.content.clone().into_bytes(), content_type),
            );
        }
        builder.multipart(mixed)
    };

    let email = email.map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
    Ok((email, message_id))
}
