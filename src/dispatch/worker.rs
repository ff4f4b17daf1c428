//! Dispatch loop: claims due jobs and records each delivery outcome.
//!
//! Each cycle claims up to `batch_size` due jobs, sends them one at a time
//! through the transport for their routing domain, and marks them `sent` or
//! reschedules them as `failed`. Storage errors end the loop; transport
//! errors never do.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::dispatch::retry::RetryPolicy;
use crate::error::{DatabaseError, TransportError};
use crate::mail::Job;
use crate::store::JobStore;
use crate::transport::TransportRouter;

/// Outcome counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Drives jobs from the store to their transports.
///
/// Run at most one per store; a second dispatcher would not double-send
/// (claims are atomic) but would split batches unpredictably.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    router: Arc<TransportRouter>,
    policy: RetryPolicy,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        router: Arc<TransportRouter>,
        policy: RetryPolicy,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            router,
            policy,
            config,
        }
    }

    /// Run a single cycle as of `now` (epoch seconds).
    pub async fn run_once(&self, now: i64) -> Result<BatchReport, DatabaseError> {
        let started = Instant::now();
        let jobs = self.store.claim_batch(now, self.config.batch_size).await?;

        let mut report = BatchReport {
            claimed: jobs.len(),
            ..Default::default()
        };
        for job in &jobs {
            match self.deliver(job).await {
                Ok(message_id) => {
                    self.store.mark_sent(&job.idem_key()).await?;
                    debug!(idem_key = %job.idem_key(), message_id = %message_id, "Job sent");
                    report.sent += 1;
                }
                Err(e) => {
                    let failed_at = now.saturating_add(started.elapsed().as_secs() as i64);
                    self.record_failure(job, failed_at, &e).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Loop forever: run a cycle, then sleep `poll_interval`.
    ///
    /// Returns only on a storage error.
    pub async fn run(&self) -> Result<(), DatabaseError> {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Dispatch loop started"
        );

        loop {
            let report = self.run_once(Utc::now().timestamp()).await.inspect_err(|e| {
                error!(error = %e, "Dispatch cycle failed, stopping");
            })?;
            if report.claimed > 0 {
                info!(
                    claimed = report.claimed,
                    sent = report.sent,
                    failed = report.failed,
                    "Dispatch cycle complete"
                );
            } else {
                debug!("No jobs due");
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn deliver(&self, job: &Job) -> Result<String, TransportError> {
        let (transport, used_default) = self.router.resolve(job.routing_domain.as_deref());
        if used_default {
            if let Some(domain) = &job.routing_domain {
                warn!(
                    domain = %domain,
                    default = %self.router.default_domain(),
                    "No transport for routing domain, using default"
                );
            }
        }

        let timeout = self.config.send_timeout;
        match tokio::time::timeout(timeout, transport.send(job)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                name: transport.name().to_string(),
                timeout,
            }),
        }
    }

    async fn record_failure(
        &self,
        job: &Job,
        failed_at: i64,
        cause: &TransportError,
    ) -> Result<(), DatabaseError> {
        let idem_key = job.idem_key();
        let try_count = job.try_count.saturating_add(1);
        let next = self.policy.next_send_at(job.try_count, failed_at);

        if self.policy.is_exhausted(try_count) {
            error!(
                idem_key = %idem_key,
                try_count,
                error = %cause,
                "Send failed, giving up"
            );
        } else {
            warn!(
                idem_key = %idem_key,
                try_count,
                retry_at = next,
                error = %cause,
                "Send failed, rescheduled"
            );
        }

        self.store.reschedule_failed(&idem_key, try_count, next).await?;
        Ok(())
    }
}

/// Spawn the dispatch loop. The handle resolves only if the loop stops.
pub fn spawn_dispatch_loop(dispatcher: Arc<Dispatcher>) -> JoinHandle<Result<(), DatabaseError>> {
    tokio::spawn(async move { dispatcher.run().await })
}
