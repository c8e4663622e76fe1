use crate::models::request::Sender;

/// Built-in sender identities hosted on the mailer domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSender {
    Support,
    Welcome,
    Storage,
    Errors,
    DoNotReply,
}

impl SystemSender {
    pub fn local_part(&self) -> &'static str {
        match self {
            SystemSender::Support => "support",
            SystemSender::Welcome => "welcome",
            SystemSender::Storage => "storage",
            SystemSender::Errors => "errors",
            SystemSender::DoNotReply => "donotreply",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SystemSender::Support => "Support",
            SystemSender::Welcome => "Welcome",
            SystemSender::Storage => "Storage",
            SystemSender::Errors => "Errors",
            SystemSender::DoNotReply => "Do Not Reply",
        }
    }

    pub fn address(&self, domain: &str) -> String {
        format!("{}@{}", self.local_part(), domain)
    }

    pub fn sender(&self, domain: &str) -> Sender {
        Sender::new(self.address(domain), self.display_name())
    }
}
