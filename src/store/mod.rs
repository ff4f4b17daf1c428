//! Persistence layer: libSQL-backed durable job queue.

pub mod libsql_backend;
pub mod migrations;
pub mod pool;
pub mod recovery;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use pool::ConnectionPool;
pub use traits::{JobRow, JobStore};
