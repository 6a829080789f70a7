//! In-process job store.
//!
//! Reproduces the PostgreSQL store's eligibility predicate, dispatch order and
//! transition rules on a map guarded by a single async mutex. Suited to tests,
//! embedded single-process deployments, and anywhere a database is overkill;
//! it offers no durability and no cross-process exclusion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use jobq_core::{
    cutoff_before, defaults, Error, Job, JobStatus, JobStore, NewJob, QueueStats, Result,
};

/// In-memory implementation of [`JobStore`].
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    notify: Arc<Notify>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs, in any status.
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Apply `apply` to a `processing` job held by `worker_id`, or explain
    /// why it cannot be.
    async fn transition<F>(&self, id: Uuid, worker_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<()>,
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        if job.status != JobStatus::Processing {
            return Err(Error::InvalidTransition {
                id,
                expected: JobStatus::Processing,
                actual: job.status,
            });
        }
        if job.worker_id.as_deref() != Some(worker_id) {
            return Err(Error::NotHolder {
                id,
                worker_id: worker_id.to_string(),
                holder: job.worker_id.clone(),
            });
        }
        apply(job, Utc::now())
    }

    fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(Job::claim_order);
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        job.validate()?;
        let job = Job::from_new(job, Utc::now());
        self.jobs.lock().await.insert(job.id, job.clone());
        self.notify.notify_waiters();
        debug!(
            subsystem = "db",
            component = "memory_store",
            op = "enqueue",
            job_id = %job.id,
            job_type = %job.job_type,
            "Job enqueued"
        );
        Ok(job)
    }

    async fn claim_next_job_for_types(
        &self,
        worker_id: &str,
        job_types: &[String],
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let next = jobs
            .values()
            .filter(|job| job.is_eligible_at(now))
            .filter(|job| job_types.is_empty() || job_types.contains(&job.job_type))
            .min_by(|a, b| Job::claim_order(a, b))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.status = JobStatus::Processing;
        job.attempts = (job.attempts + 1).min(job.max_attempts);
        job.worker_id = Some(worker_id.to_string());
        job.processed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, id: Uuid, worker_id: &str) -> Result<()> {
        self.transition(id, worker_id, |job, now| {
            job.status = JobStatus::Completed;
            job.worker_id = None;
            job.completed_at = Some(now);
            job.updated_at = now;
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, worker_id: &str, error: &str) -> Result<()> {
        self.transition(id, worker_id, |job, now| {
            job.status = JobStatus::Failed;
            job.worker_id = None;
            job.last_error = Some(error.to_string());
            job.updated_at = now;
            Ok(())
        })
        .await
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(id, worker_id, |job, now| {
            if !job.has_attempts_remaining() {
                return Err(Error::InvalidInput(format!(
                    "job {id} has exhausted its {} attempts",
                    job.max_attempts
                )));
            }
            job.status = JobStatus::Pending;
            job.worker_id = None;
            job.last_error = Some(error.to_string());
            job.retry_after = Some(retry_after);
            job.updated_at = now;
            Ok(())
        })
        .await
    }

    async fn cancel_job(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        if !job.status.is_cancellable() {
            return Err(Error::CannotCancel {
                id,
                status: job.status,
            });
        }
        job.status = JobStatus::Cancelled;
        job.worker_id = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn release_job(&self, id: Uuid, worker_id: &str) -> Result<()> {
        self.transition(id, worker_id, |job, now| {
            job.status = JobStatus::Pending;
            job.worker_id = None;
            job.updated_at = now;
            Ok(())
        })
        .await?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }

    async fn list_pending_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let pending: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .cloned()
            .collect();
        Ok(Self::sorted(pending).into_iter().take(limit).collect())
    }

    async fn list_processing_jobs(&self) -> Result<Vec<Job>> {
        let processing: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .cloned()
            .collect();
        Ok(Self::sorted(processing))
    }

    async fn cleanup_old_jobs(&self, older_than: Duration) -> Result<u64> {
        let cutoff = cutoff_before(Utc::now(), older_than)?;
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn recover_stale_jobs(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = cutoff_before(now, older_than)?;
        let mut recovered = 0;
        let mut requeued = false;
        for job in self.jobs.lock().await.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.processed_at.map_or(false, |at| at < cutoff);
            if !stale {
                continue;
            }
            if job.has_attempts_remaining() {
                job.status = JobStatus::Pending;
                requeued = true;
            } else {
                job.status = JobStatus::Failed;
                job.last_error = Some(defaults::STALE_JOB_ERROR.to_string());
            }
            job.worker_id = None;
            job.updated_at = now;
            recovered += 1;
        }
        if requeued {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
