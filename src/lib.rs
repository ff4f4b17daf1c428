//! Scheduled mailer: durable, at-least-once deferred email queue.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mail;
pub mod store;
pub mod transport;
