//! libSQL connection pool backed by `deadpool`.
//!
//! At most `size` connections are checked out at once; callers beyond that
//! wait for one to be returned. Each new connection gets a `busy_timeout` so
//! SQLite serializes conflicting writers instead of failing them immediately.

use std::path::Path;
use std::time::Duration;

use deadpool::managed::{self, Metrics, PoolError, RecycleResult};
use libsql::{Connection, Database as LibSqlDatabase};
use tracing::debug;

use crate::error::DatabaseError;

/// A checked-out connection; returned to the pool on drop.
pub type PooledConnection = managed::Object<LibSqlManager>;

/// Opens connections to one libSQL database.
pub struct LibSqlManager {
    db: LibSqlDatabase,
    busy_timeout: Duration,
}

impl managed::Manager for LibSqlManager {
    type Type = Connection;
    type Error = DatabaseError;

    async fn create(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // PRAGMA returns a row, so it goes through query() rather than execute().
        conn.query(
            &format!("PRAGMA busy_timeout = {}", self.busy_timeout.as_millis()),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {e}")))?;

        debug!("Opened new pooled connection");
        Ok(conn)
    }

    async fn recycle(&self, _conn: &mut Connection, _: &Metrics) -> RecycleResult<DatabaseError> {
        Ok(())
    }
}

pub struct ConnectionPool {
    pool: managed::Pool<LibSqlManager>,
}

impl ConnectionPool {
    /// Open (or create) a local database file.
    pub async fn open_local(
        path: &Path,
        size: usize,
        busy_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        Self::build(LibSqlManager { db, busy_timeout }, size.max(1))
    }

    /// Create an in-memory database.
    ///
    /// Each in-memory connection is its own database, so the pool holds
    /// exactly one and recycles it forever.
    pub async fn open_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::build(
            LibSqlManager {
                db,
                busy_timeout: Duration::ZERO,
            },
            1,
        )
    }

    fn build(manager: LibSqlManager, size: usize) -> Result<Self, DatabaseError> {
        let pool = managed::Pool::builder(manager)
            .max_size(size)
            .build()
            .map_err(|e| DatabaseError::Pool(format!("Failed to build pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Maximum number of concurrently checked-out connections.
    pub fn size(&self) -> usize {
        self.pool.status().max_size
    }

    /// Check out a connection, waiting for a free slot if the pool is exhausted.
    pub async fn get(&self) -> Result<PooledConnection, DatabaseError> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Backend(e) => e,
            other => DatabaseError::Pool(format!("Failed to check out connection: {other}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_reuses_single_connection() {
        let pool = ConnectionPool::open_memory().await.unwrap();
        assert_eq!(pool.size(), 1);

        {
            let conn = pool.get().await.unwrap();
            conn.execute("CREATE TABLE t (x INTEGER)", ()).await.unwrap();
            conn.execute("INSERT INTO t (x) VALUES (1)", ()).await.unwrap();
        }

        // Same database is visible through the returned connection.
        let conn = pool.get().await.unwrap();
        let mut rows = conn.query("SELECT COUNT(*) FROM t", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn local_pool_shares_file_between_connections() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("pool.db");
        let pool = ConnectionPool::open_local(&path, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(pool.size(), 2);

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        a.execute("CREATE TABLE t (x INTEGER)", ()).await.unwrap();
        b.execute("INSERT INTO t (x) VALUES (7)", ()).await.unwrap();

        let mut rows = a.query("SELECT x FROM t", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let x: i64 = row.get(0).unwrap();
        assert_eq!(x, 7);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn pool_bounds_checkouts() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open_local(&tmp.path().join("b.db"), 1, Duration::from_secs(1))
            .await
            .unwrap();

        let held = pool.get().await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(waited.is_err(), "second checkout should wait for the first");

        drop(held);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn zero_size_is_clamped_to_one() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open_local(&tmp.path().join("z.db"), 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pool.size(), 1);
        assert!(pool.get().await.is_ok());
    }
}
