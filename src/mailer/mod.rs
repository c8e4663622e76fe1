pub mod composer;
pub mod dedupe;
pub mod dispatcher;
pub mod policy;
pub mod senders;

pub use composer::MessageComposer;
pub use dispatcher::{EmailDispatcher, Mailer, SEND_EMAIL_JOB};
pub use senders::SystemSender;
