pub mod health;
pub mod redis;
pub mod smtp;
pub mod template;
