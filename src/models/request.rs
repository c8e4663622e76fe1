use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use lettre::Address;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Wire shape of a notification as callers submit it and as it is persisted
/// inside a queued job. Nothing here is trusted until it has been turned into
/// a [`NotificationRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tos: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ccs: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bccs: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<HashMap<String, serde_json::Value>>,
}

impl NotificationPayload {
    pub fn new(sender: Sender, subject: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            from: Some(sender.address),
            name: Some(sender.name),
            subject: Some(subject.into()),
            template: Some(template.into()),
            ..Default::default()
        }
    }

    pub fn with_to(mut self, address: impl Into<String>) -> Self {
        self.tos.get_or_insert_with(Vec::new).push(address.into());
        self
    }

    pub fn with_cc(mut self, address: impl Into<String>) -> Self {
        self.ccs.get_or_insert_with(Vec::new).push(address.into());
        self
    }

    pub fn with_bcc(mut self, address: impl Into<String>) -> Self {
        self.bccs.get_or_insert_with(Vec::new).push(address.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.get_or_insert_with(Vec::new).push(attachment);
        self
    }

    pub fn validate(self) -> Result<NotificationRequest, ValidationError> {
        NotificationRequest::try_from(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub address: String,
    pub name: String,
}

impl Sender {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

/// Which template set a template name is resolved against.
///
/// `"Admin.Invite"` selects the `Invite` template of the `Admin` scope, a bare
/// `"Welcome"` selects the global set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    Global(String),
    Scoped { scope: String, name: String },
}

impl TemplateRef {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidTemplate(raw.to_string());

        match raw.split_once('.') {
            None if !raw.is_empty() => Ok(TemplateRef::Global(raw.to_string())),
            None => Err(invalid()),
            Some((scope, name)) => {
                if scope.is_empty() || name.is_empty() || name.contains('.') {
                    return Err(invalid());
                }
                Ok(TemplateRef::Scoped {
                    scope: scope.to_string(),
                    name: name.to_string(),
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TemplateRef::Global(name) => name,
            TemplateRef::Scoped { name, .. } => name,
        }
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateRef::Global(name) => write!(f, "{}", name),
            TemplateRef::Scoped { scope, name } => write!(f, "{}.{}", scope, name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

/// A notification that passed shape validation. Only obtainable through
/// `TryFrom<NotificationPayload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    sender: Sender,
    subject: String,
    template: TemplateRef,
    recipients: Recipients,
    attachments: Vec<Attachment>,
    template_args: BTreeMap<String, String>,
}

impl NotificationRequest {
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn template(&self) -> &TemplateRef {
        &self.template
    }

    pub fn recipients(&self) -> &Recipients {
        &self.recipients
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn template_args(&self) -> &BTreeMap<String, String> {
        &self.template_args
    }
}

impl TryFrom<NotificationPayload> for NotificationRequest {
    type Error = ValidationError;

    fn try_from(payload: NotificationPayload) -> Result<Self, Self::Error> {
        let address = required(payload.from, "from")?;
        let name = required(payload.name, "name")?;
        let subject = required(payload.subject, "subject")?;
        let template = required(payload.template, "template")?;

        let template = TemplateRef::parse(&template)?;
        check_address("from", &address)?;

        let to = payload.tos.unwrap_or_default();
        if to.is_empty() {
            return Err(ValidationError::NoRecipients);
        }
        let cc = payload.ccs.unwrap_or_default();
        let bcc = payload.bccs.unwrap_or_default();

        for (field, list) in [("tos", &to), ("ccs", &cc), ("bccs", &bcc)] {
            for recipient in list {
                check_address(field, recipient)?;
            }
        }

        let mut template_args = BTreeMap::new();
        for (key, value) in payload.args.unwrap_or_default() {
            match value {
                serde_json::Value::String(s) => {
                    template_args.insert(key, s);
                }
                _ => return Err(ValidationError::NonStringArgument(key)),
            }
        }

        Ok(Self {
            sender: Sender { address, name },
            subject,
            template,
            recipients: Recipients { to, cc, bcc },
            attachments: payload.attachments.unwrap_or_default(),
            template_args,
        })
    }
}

impl From<&NotificationRequest> for NotificationPayload {
    fn from(request: &NotificationRequest) -> Self {
        let args = request
            .template_args
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<HashMap<_, _>>();

        Self {
            from: Some(request.sender.address.clone()),
            name: Some(request.sender.name.clone()),
            subject: Some(request.subject.clone()),
            template: Some(request.template.to_string()),
            tos: Some(request.recipients.to.clone()),
            ccs: Some(request.recipients.cc.clone()),
            bccs: Some(request.recipients.bcc.clone()),
            attachments: Some(request.attachments.clone()),
            args: Some(args),
        }
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field)),
    }
}

fn check_address(field: &'static str, value: &str) -> Result<(), ValidationError> {
    value
        .parse::<Address>()
        .map(|_| ())
        .map_err(|_| ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        })
}
