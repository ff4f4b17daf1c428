//! `JobStore` trait: the single async interface over persisted job state.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::mail::{Job, JobState};

/// One row of a listing. A row whose attachments no longer decode is
/// reported as [`DatabaseError::Codec`] in place, so it stays visible.
pub type JobRow = Result<Job, DatabaseError>;

/// Backend-agnostic durable job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job as `unsent` with a zero try count.
    ///
    /// Fails with [`DatabaseError::Conflict`] if its idempotency key exists.
    async fn insert(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Look up a job by idempotency key.
    async fn get_by_idem_key(&self, idem_key: &str) -> Result<Option<Job>, DatabaseError>;

    /// All jobs sharing a caller job key.
    async fn get_by_job_key(&self, job_key: &str) -> Result<Vec<JobRow>, DatabaseError>;

    /// All jobs in the given state, earliest `send_at` first.
    async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRow>, DatabaseError>;

    /// Atomically select up to `limit` due jobs and mark them in progress.
    ///
    /// Due means `send_at <= now` and either `unsent`, or `failed` below the
    /// attempt ceiling. Returned jobs are already `InProgress`, earliest
    /// `send_at` first. No two callers ever receive the same job.
    async fn claim_batch(&self, now: i64, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    /// Transition a job to `sent`.
    async fn mark_sent(&self, idem_key: &str) -> Result<bool, DatabaseError>;

    /// Transition a job to `failed` with a new attempt count and due time.
    /// Never touches a `sent` job.
    async fn reschedule_failed(
        &self,
        idem_key: &str,
        try_count: u32,
        send_at: i64,
    ) -> Result<bool, DatabaseError>;

    /// Move every `inprog` job back to `failed`, keeping its try count and
    /// due time. Returns the number of jobs reset.
    async fn reset_in_progress(&self) -> Result<u64, DatabaseError>;

    /// Delete pending (`unsent` or `failed`) jobs with this job key.
    async fn delete_by_job_key(&self, job_key: &str) -> Result<u64, DatabaseError>;

    /// Delete pending (`unsent` or `failed`) jobs with this subscription key.
    async fn delete_by_subscription_key(&self, subscription_key: &str)
    -> Result<u64, DatabaseError>;

    /// Delete every not-yet-sent job with this missive key, including in-flight ones.
    async fn cancel_by_missive_key(&self, missive_key: &str) -> Result<u64, DatabaseError>;

    /// Delete every not-yet-sent job with this job key, including in-flight ones.
    async fn cancel_by_job_key(&self, job_key: &str) -> Result<u64, DatabaseError>;
}
