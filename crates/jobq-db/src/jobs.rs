//! PostgreSQL job store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use jobq_core::{
    cutoff_before, defaults, Error, Job, JobPriority, JobStatus, JobStore, NewJob, QueueStats,
    Result,
};

/// Column list shared by every query that returns whole jobs.
macro_rules! job_columns {
    () => {
        "id, job_type, payload, status, priority, attempts, max_attempts, created_at, \
         updated_at, scheduled_for, retry_after, processed_at, completed_at, last_error, \
         worker_id, metadata"
    };
}

/// Dispatch order, identical for claiming and for diagnostic listings.
macro_rules! claim_order {
    () => {
        "ORDER BY priority DESC, created_at ASC, id ASC"
    };
}

/// PostgreSQL implementation of [`JobStore`].
///
/// Claiming uses `FOR UPDATE SKIP LOCKED`, so any number of processes can
/// poll the same table without double-claiming or blocking on each other.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
    /// Notify handle for event-driven worker wake.
    notify: Arc<Notify>,
}

impl PgJobStore {
    /// Create a new PgJobStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a new PgJobStore sharing an existing notify handle.
    pub fn with_notify(pool: Pool<Postgres>, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        let priority: i32 = row.try_get("priority")?;
        Ok(Job {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: status.parse()?,
            priority: JobPriority::from_weight(priority),
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            scheduled_for: row.try_get("scheduled_for")?,
            retry_after: row.try_get("retry_after")?,
            processed_at: row.try_get("processed_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
            worker_id: row.try_get("worker_id")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn parse_job_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Job>> {
        rows.into_iter().map(Self::parse_job_row).collect()
    }

    /// Explain why a conditional transition on `id` by `worker_id` matched no row.
    async fn transition_error(&self, id: Uuid, worker_id: &str, expected: JobStatus) -> Error {
        match self.get_job(id).await {
            Ok(Some(job))
                if job.status == expected && job.worker_id.as_deref() != Some(worker_id) =>
            {
                Error::NotHolder {
                    id,
                    worker_id: worker_id.to_string(),
                    holder: job.worker_id,
                }
            }
            Ok(Some(job)) if job.status == expected && !job.has_attempts_remaining() => {
                Error::InvalidInput(format!(
                    "job {id} has exhausted its {} attempts",
                    job.max_attempts
                ))
            }
            Ok(Some(job)) => Error::InvalidTransition {
                id,
                expected,
                actual: job.status,
            },
            Ok(None) => Error::JobNotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        job.validate()?;
        let job = Job::from_new(job, Utc::now());

        sqlx::query(
            "INSERT INTO jobs (id, job_type, payload, status, priority, attempts, max_attempts,
                               created_at, updated_at, scheduled_for, metadata)
             VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $7, $8, $9)",
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.priority.weight())
        .bind(job.max_attempts)
        .bind(job.created_at)
        .bind(job.scheduled_for)
        .bind(&job.metadata)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.notify.notify_waiters();
        debug!(
            subsystem = "db",
            component = "store",
            op = "enqueue",
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            "Job enqueued"
        );
        Ok(job)
    }

    #[instrument(skip(self), fields(subsystem = "db", component = "store", op = "claim_next"))]
    async fn claim_next_job_for_types(
        &self,
        worker_id: &str,
        job_types: &[String],
    ) -> Result<Option<Job>> {
        let now = Utc::now();

        // The inner SELECT locks exactly one eligible row; rows already locked
        // by a concurrent claimant are skipped rather than waited on.
        // LEAST keeps a released job that already used its last attempt
        // within the ceiling when it runs again.
        let row = sqlx::query(concat!(
            "UPDATE jobs
             SET status = 'processing',
                 attempts = LEAST(attempts + 1, max_attempts),
                 worker_id = $1,
                 processed_at = $2,
                 updated_at = $2
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'pending'
                   AND (scheduled_for IS NULL OR scheduled_for <= $2)
                   AND (retry_after IS NULL OR retry_after <= $2)
                   AND (cardinality($3::text[]) = 0 OR job_type = ANY($3))
                 ",
            claim_order!(),
            "
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING ",
            job_columns!()
        ))
        .bind(worker_id)
        .bind(now)
        .bind(job_types)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn mark_completed(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'completed', worker_id = NULL, completed_at = $2, updated_at = $2
             WHERE id = $1 AND status = 'processing' AND worker_id = $3",
        )
        .bind(id)
        .bind(now)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, worker_id, JobStatus::Processing).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, worker_id: &str, error: &str) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'failed', worker_id = NULL, last_error = $2, updated_at = $3
             WHERE id = $1 AND status = 'processing' AND worker_id = $4",
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, worker_id, JobStatus::Processing).await);
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'pending', worker_id = NULL, last_error = $2,
                 retry_after = $3, updated_at = $4
             WHERE id = $1 AND status = 'processing' AND worker_id = $5
               AND attempts < max_attempts",
        )
        .bind(id)
        .bind(error)
        .bind(retry_after)
        .bind(now)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, worker_id, JobStatus::Processing).await);
        }
        Ok(())
    }

    async fn cancel_job(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'cancelled', worker_id = NULL, updated_at = $2
             WHERE id = $1 AND status IN ('pending', 'failed')",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return match self.get_job(id).await? {
                Some(job) => Err(Error::CannotCancel {
                    id,
                    status: job.status,
                }),
                None => Err(Error::JobNotFound(id)),
            };
        }
        Ok(())
    }

    async fn release_job(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'pending', worker_id = NULL, updated_at = $2
             WHERE id = $1 AND status = 'processing' AND worker_id = $3",
        )
        .bind(id)
        .bind(now)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, worker_id, JobStatus::Processing).await);
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COUNT(*) AS total
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            cancelled: row.try_get("cancelled")?,
            total: row.try_get("total")?,
        })
    }

    async fn list_pending_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE status = 'pending' ",
            claim_order!(),
            " LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_job_rows(rows)
    }

    async fn list_processing_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE status = 'processing' ",
            claim_order!()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_job_rows(rows)
    }

    async fn cleanup_old_jobs(&self, older_than: Duration) -> Result<u64> {
        let cutoff = cutoff_before(Utc::now(), older_than)?;
        let result = sqlx::query(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let removed = result.rows_affected();
        info!(
            subsystem = "db",
            component = "store",
            op = "cleanup",
            rows_affected = removed,
            %cutoff,
            "Removed old terminal jobs"
        );
        Ok(removed)
    }

    async fn recover_stale_jobs(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = cutoff_before(now, older_than)?;
        // A job already on its last attempt fails instead of running again.
        let result = sqlx::query(
            "UPDATE jobs
             SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                 last_error = CASE WHEN attempts < max_attempts THEN last_error ELSE $3 END,
                 worker_id = NULL,
                 updated_at = $1
             WHERE status = 'processing' AND processed_at < $2",
        )
        .bind(now)
        .bind(cutoff)
        .bind(defaults::STALE_JOB_ERROR)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            self.notify.notify_waiters();
            info!(
                subsystem = "db",
                component = "store",
                op = "recover_stale",
                rows_affected = recovered,
                "Recovered stale processing jobs"
            );
        }
        Ok(recovered)
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
