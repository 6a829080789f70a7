//! Storage abstraction for the job queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{Job, NewJob, QueueStats, Result};

/// Durable job persistence and the sole authority over state transitions.
///
/// Every method must be atomic with respect to concurrent callers, including
/// callers in other processes sharing the same backing store. Backends must
/// reproduce the eligibility predicate ([`Job::is_eligible_at`]) and the
/// dispatch order ([`Job::claim_order`]) exactly.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate and persist a new `pending` job. Does not start execution.
    async fn enqueue(&self, job: NewJob) -> Result<Job>;

    /// Claim the next eligible job of any type.
    async fn claim_next_job(&self, worker_id: &str) -> Result<Option<Job>> {
        self.claim_next_job_for_types(worker_id, &[]).await
    }

    /// Claim the next eligible job whose type is in `job_types`.
    /// An empty slice means "claim any type" (same as `claim_next_job`).
    ///
    /// Moves the job to `processing`, increments its attempts, and stamps the
    /// worker id. Two concurrent callers never receive the same job; a caller
    /// that meets a row locked by another claimant skips past it.
    async fn claim_next_job_for_types(
        &self,
        worker_id: &str,
        job_types: &[String],
    ) -> Result<Option<Job>>;

    // The transitions below apply only while `worker_id` holds the job. A job
    // in another state is `InvalidTransition`; a job held by someone else
    // (after stale recovery handed it on) is `NotHolder`.

    /// `processing` -> `completed`.
    async fn mark_completed(&self, id: Uuid, worker_id: &str) -> Result<()>;

    /// `processing` -> `failed`, recording the error.
    async fn mark_failed(&self, id: Uuid, worker_id: &str, error: &str) -> Result<()>;

    /// `processing` -> `pending`, eligible again at `retry_after`. Attempts are kept.
    async fn schedule_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<()>;

    /// `pending | failed` -> `cancelled`; anything else is [`crate::Error::CannotCancel`].
    async fn cancel_job(&self, id: Uuid) -> Result<()>;

    /// `processing` -> `pending` without consuming an attempt. Shutdown only.
    async fn release_job(&self, id: Uuid, worker_id: &str) -> Result<()>;

    /// Get job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Job counts by status.
    async fn get_stats(&self) -> Result<QueueStats>;

    /// Pending jobs in dispatch order.
    async fn list_pending_jobs(&self, limit: i64) -> Result<Vec<Job>>;

    /// Processing jobs in dispatch order.
    async fn list_processing_jobs(&self) -> Result<Vec<Job>>;

    /// Delete terminal jobs last updated more than `older_than` ago.
    async fn cleanup_old_jobs(&self, older_than: Duration) -> Result<u64>;

    /// Recover `processing` jobs claimed more than `older_than` ago, for work
    /// stranded by a process that died mid-job.
    ///
    /// Jobs with attempts left return to `pending`; jobs on their last attempt
    /// become `failed` with [`crate::defaults::STALE_JOB_ERROR`]. Returns the
    /// number of jobs moved either way.
    async fn recover_stale_jobs(&self, older_than: Duration) -> Result<u64>;

    /// Handle notified on every enqueue so idle in-process workers wake early.
    fn job_notify(&self) -> Arc<Notify>;
}

/// Convert a retention window into the cutoff timestamp it describes.
pub fn cutoff_before(now: DateTime<Utc>, older_than: Duration) -> Result<DateTime<Utc>> {
    let age = chrono::Duration::from_std(older_than)
        .map_err(|e| crate::Error::InvalidInput(format!("age out of range: {e}")))?;
    Ok(now - age)
}
