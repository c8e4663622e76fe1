use serde::{Deserialize, Serialize};

use crate::models::request::{Attachment, Recipients, Sender};

/// Output of the template renderer plus the derived plain-text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// A message ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedMessage {
    pub from: Sender,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl ComposedMessage {
    pub fn new(
        from: Sender,
        recipients: Recipients,
        content: RenderedContent,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            from,
            to: recipients.to,
            cc: recipients.cc,
            bcc: recipients.bcc,
            subject: content.subject,
            html: content.html,
            text: content.text,
            attachments,
        }
    }

    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub accepted: Vec<String>,
    pub response: String,
}
