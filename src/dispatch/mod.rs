//! Background dispatch: claims due jobs and hands them to transports.

pub mod retry;
pub mod worker;

pub use retry::RetryPolicy;
pub use worker::{BatchReport, Dispatcher, spawn_dispatch_loop};
