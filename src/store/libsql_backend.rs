//! libSQL backend: async `JobStore` implementation.
//!
//! Rows live in the `scheduled` table. Every operation checks a connection
//! out of the [`ConnectionPool`]; the claim runs inside an IMMEDIATE
//! transaction so concurrent claimers serialize on the write lock.

use std::path::Path;

use async_trait::async_trait;
use libsql::{Connection, TransactionBehavior, Value, params};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::DatabaseError;
use crate::mail::attachments;
use crate::mail::{Job, JobState};
use crate::store::migrations;
use crate::store::pool::ConnectionPool;
use crate::store::recovery;
use crate::store::traits::{JobRow, JobStore};

/// Attempt ceiling used when no config is supplied.
const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Column list shared by every job query, in `row_to_job` order.
const JOB_COLUMNS: &str = "idem_key, job_key, sub, missive, to_addr, to_name, from_addr, \
    from_name, reply_to, title, html_body, text_body, attachments, send_at, state, \
    try_count, mail_domain";

/// libSQL job store.
pub struct LibSqlBackend {
    pool: ConnectionPool,
    max_attempts: u32,
}

impl LibSqlBackend {
    /// Open (or create) the database file, migrate it, and recover jobs
    /// stranded in progress by a previous run.
    pub async fn new_local(config: &StoreConfig) -> Result<Self, DatabaseError> {
        let pool =
            ConnectionPool::open_local(&config.path, config.pool_size, config.busy_timeout).await?;
        let backend = Self {
            pool,
            max_attempts: config.max_attempts,
        };
        backend.init().await?;
        info!(path = %config.path.display(), pool_size = config.pool_size, "Database opened");
        Ok(backend)
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let backend = Self {
            pool: ConnectionPool::open_memory().await?,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        backend.init().await?;
        Ok(backend)
    }

    /// Open a file-backed store with default settings at `path`.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::new_local(&StoreConfig {
            path: path.to_path_buf(),
            ..StoreConfig::default()
        })
        .await
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn init(&self) -> Result<(), DatabaseError> {
        {
            let conn = self.pool.get().await?;
            migrations::run_migrations(&conn).await?;
        }
        recovery::recover(self).await?;
        Ok(())
    }

    /// Run a job query and collect the rows. Rows that fail to decode are
    /// kept in place as errors.
    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Vec<JobRow>, DatabaseError> {
        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            let job = row_to_job(&row);
            if let Err(e) = &job {
                warn!("Unreadable job row: {e}");
            }
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn execute(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<u64, DatabaseError> {
        let conn = self.pool.get().await?;
        conn.execute(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
    }
}

/// Mark due rows in progress and return them, dead-lettering undecodable ones.
async fn claim_in_tx(
    conn: &Connection,
    now: i64,
    limit: usize,
    max_attempts: u32,
) -> Result<Vec<Job>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "UPDATE scheduled SET state = 'inprog' WHERE idem_key IN (
                    SELECT idem_key FROM scheduled
                    WHERE ((state = 'failed' AND try_count < ?1) OR state = 'unsent')
                      AND send_at <= ?2
                    ORDER BY send_at ASC, idem_key ASC
                    LIMIT ?3
                ) RETURNING {JOB_COLUMNS}"
            ),
            params![
                i64::from(max_attempts),
                now,
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("claim_batch: {e}")))?;

    let mut jobs = Vec::new();
    let mut corrupt = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("claim_batch: {e}")))?
    {
        match row_to_job(&row) {
            Ok(job) => jobs.push(job),
            Err(e) => {
                let idem_key = text(&row, 0)?;
                warn!(idem_key = %idem_key, "Dead-lettering undecodable job: {e}");
                corrupt.push(idem_key);
            }
        }
    }
    drop(rows);

    for idem_key in corrupt {
        conn.execute(
            "UPDATE scheduled SET state = 'failed', try_count = ?2 WHERE idem_key = ?1",
            params![idem_key, i64::from(max_attempts)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("claim_batch dead-letter: {e}")))?;
    }

    // RETURNING order is unspecified.
    jobs.sort_by_cached_key(|j| (j.send_at, j.idem_key()));
    Ok(jobs)
}

fn text_param(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn value_at(row: &libsql::Row, idx: i32) -> Result<Value, DatabaseError> {
    row.get_value(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    match value_at(row, idx)? {
        Value::Text(s) => Ok(s),
        other => Err(DatabaseError::Query(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
    }
}

/// Nullable text column; empty strings read back as `None`.
fn opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>, DatabaseError> {
    match value_at(row, idx)? {
        Value::Null => Ok(None),
        Value::Text(s) if s.is_empty() => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        other => Err(DatabaseError::Query(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
    }
}

fn integer(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    match value_at(row, idx)? {
        Value::Integer(n) => Ok(n),
        other => Err(DatabaseError::Query(format!(
            "column {idx}: expected integer, got {other:?}"
        ))),
    }
}

fn opt_blob(row: &libsql::Row, idx: i32) -> Result<Option<Vec<u8>>, DatabaseError> {
    match value_at(row, idx)? {
        Value::Null => Ok(None),
        Value::Blob(b) => Ok(Some(b)),
        other => Err(DatabaseError::Query(format!(
            "column {idx}: expected blob, got {other:?}"
        ))),
    }
}

/// Map a row selected with `JOB_COLUMNS` to a `Job`.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let idem_key = text(row, 0)?;
    let attachments = attachments::decode_set(opt_blob(row, 12)?.as_deref()).map_err(|source| {
        DatabaseError::Codec {
            idem_key: idem_key.clone(),
            source,
        }
    })?;
    let state: JobState = text(row, 14)?
        .parse()
        .map_err(|e: String| DatabaseError::Query(format!("{idem_key}: {e}")))?;
    let try_count = u32::try_from(integer(row, 15)?)
        .map_err(|e| DatabaseError::Query(format!("{idem_key}: try_count: {e}")))?;

    Ok(Job {
        job_key: text(row, 1)?,
        subscription_key: opt_text(row, 2)?,
        missive_key: opt_text(row, 3)?,
        to_addr: text(row, 4)?,
        to_name: opt_text(row, 5)?,
        from_addr: opt_text(row, 6)?,
        from_name: opt_text(row, 7)?,
        reply_to: opt_text(row, 8)?,
        subject: text(row, 9)?,
        html_body: opt_text(row, 10)?,
        text_body: opt_text(row, 11)?,
        attachments,
        send_at: integer(row, 13)?,
        routing_domain: opt_text(row, 16)?,
        state,
        try_count,
    })
}

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn insert(&self, job: &Job) -> Result<(), DatabaseError> {
        let idem_key = job.idem_key();
        let blob = attachments::encode_set(&job.attachments).map_err(|source| {
            DatabaseError::Codec {
                idem_key: idem_key.clone(),
                source,
            }
        })?;

        let changed = self
            .execute(
                "insert",
                "INSERT INTO scheduled (idem_key, job_key, sub, missive, to_addr, to_name,
                    from_addr, from_name, reply_to, title, html_body, text_body, attachments,
                    send_at, state, try_count, mail_domain)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                    'unsent', 0, ?15)
                 ON CONFLICT(idem_key) DO NOTHING",
                vec![
                    Value::Text(idem_key.clone()),
                    Value::Text(job.job_key.clone()),
                    text_param(&job.subscription_key),
                    text_param(&job.missive_key),
                    Value::Text(job.to_addr.clone()),
                    text_param(&job.to_name),
                    text_param(&job.from_addr),
                    text_param(&job.from_name),
                    text_param(&job.reply_to),
                    Value::Text(job.subject.clone()),
                    Value::Text(job.html_body.clone().unwrap_or_default()),
                    Value::Text(job.text_body.clone().unwrap_or_default()),
                    blob.map(Value::Blob).unwrap_or(Value::Null),
                    Value::Integer(job.send_at),
                    text_param(&job.routing_domain),
                ],
            )
            .await?;

        if changed == 0 {
            return Err(DatabaseError::Conflict { idem_key });
        }
        debug!(idem_key = %idem_key, send_at = job.send_at, "Job scheduled");
        Ok(())
    }

    async fn get_by_idem_key(&self, idem_key: &str) -> Result<Option<Job>, DatabaseError> {
        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled WHERE idem_key = ?1"),
                params![idem_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_by_idem_key: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_by_idem_key: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_by_job_key(&self, job_key: &str) -> Result<Vec<JobRow>, DatabaseError> {
        self.query_jobs(
            "get_by_job_key",
            &format!(
                "SELECT {JOB_COLUMNS} FROM scheduled WHERE job_key = ?1 ORDER BY send_at ASC, idem_key ASC"
            ),
            params![job_key],
        )
        .await
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRow>, DatabaseError> {
        self.query_jobs(
            "list_by_state",
            &format!(
                "SELECT {JOB_COLUMNS} FROM scheduled WHERE state = ?1 ORDER BY send_at ASC, idem_key ASC"
            ),
            params![state.as_str()],
        )
        .await
    }

    async fn claim_batch(&self, now: i64, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.pool.get().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_batch begin: {e}")))?;

        match claim_in_tx(&tx, now, limit, self.max_attempts).await {
            Ok(jobs) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("claim_batch commit: {e}")))?;
                if !jobs.is_empty() {
                    debug!(count = jobs.len(), now, "Claimed jobs");
                }
                Ok(jobs)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn mark_sent(&self, idem_key: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "mark_sent",
                "UPDATE scheduled SET state = 'sent' WHERE idem_key = ?1 AND state != 'sent'",
                params![idem_key],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn reschedule_failed(
        &self,
        idem_key: &str,
        try_count: u32,
        send_at: i64,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "reschedule_failed",
                "UPDATE scheduled SET state = 'failed', try_count = ?2, send_at = ?3
                 WHERE idem_key = ?1 AND state != 'sent'",
                params![idem_key, i64::from(try_count), send_at],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn reset_in_progress(&self) -> Result<u64, DatabaseError> {
        self.execute(
            "reset_in_progress",
            "UPDATE scheduled SET state = 'failed' WHERE state = 'inprog'",
            (),
        )
        .await
    }

    async fn delete_by_job_key(&self, job_key: &str) -> Result<u64, DatabaseError> {
        self.execute(
            "delete_by_job_key",
            "DELETE FROM scheduled WHERE job_key = ?1 AND state IN ('unsent', 'failed')",
            params![job_key],
        )
        .await
    }

    async fn delete_by_subscription_key(
        &self,
        subscription_key: &str,
    ) -> Result<u64, DatabaseError> {
        self.execute(
            "delete_by_subscription_key",
            "DELETE FROM scheduled WHERE sub = ?1 AND state IN ('unsent', 'failed')",
            params![subscription_key],
        )
        .await
    }

    async fn cancel_by_missive_key(&self, missive_key: &str) -> Result<u64, DatabaseError> {
        self.execute(
            "cancel_by_missive_key",
            "DELETE FROM scheduled WHERE missive = ?1 AND state != 'sent'",
            params![missive_key],
        )
        .await
    }

    async fn cancel_by_job_key(&self, job_key: &str) -> Result<u64, DatabaseError> {
        self.execute(
            "cancel_by_job_key",
            "DELETE FROM scheduled WHERE job_key = ?1 AND state != 'sent'",
            params![job_key],
        )
        .await
    }
}
