pub mod api;
pub mod clients;
pub mod config;
pub mod error;
pub mod mailer;
pub mod models;
pub mod queue;
pub mod utils;
