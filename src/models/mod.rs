pub mod health;
pub mod job;
pub mod message;
pub mod request;
pub mod retry;
pub mod status;
