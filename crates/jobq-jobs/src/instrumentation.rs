//! Passive lifecycle observers.
//!
//! The pool reports every lifecycle point to an [`Instrumentation`]. Observers
//! never influence scheduling: they cannot fail and their callbacks are
//! synchronous, so a slow observer should hand work off rather than block.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobq_core::{defaults, Job, WorkerStats};

/// Observer of job and pool lifecycle events. Every method defaults to a no-op.
pub trait Instrumentation: Send + Sync {
    fn job_enqueued(&self, _job: &Job) {}

    fn job_started(&self, _job: &Job, _worker_id: &str) {}

    fn job_completed(&self, _job: &Job, _duration: Duration) {}

    /// The job reached `failed`; no retries remain or the failure is permanent.
    fn job_failed(&self, _job: &Job, _error: &str, _duration: Duration) {}

    fn job_retried(&self, _job: &Job, _error: &str, _retry_after: DateTime<Utc>) {}

    fn job_cancelled(&self, _job_id: Uuid) {}

    fn heartbeat(&self, _stats: &WorkerStats) {}

    fn pool_started(&self, _worker_ids: &[String]) {}

    /// `clean` is false when shutdown exceeded its timeout.
    fn pool_stopped(&self, _clean: bool) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {}

/// Emits lifecycle points as `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogInstrumentation;

impl Instrumentation for LogInstrumentation {
    fn job_enqueued(&self, job: &Job) {
        info!(
            subsystem = "jobs",
            op = "enqueue",
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            "Job enqueued"
        );
    }

    fn job_started(&self, job: &Job, worker_id: &str) {
        debug!(
            subsystem = "jobs",
            op = "execute",
            job_id = %job.id,
            job_type = %job.job_type,
            worker_id,
            attempts = job.attempts,
            "Job started"
        );
    }

    fn job_completed(&self, job: &Job, duration: Duration) {
        info!(
            subsystem = "jobs",
            op = "execute",
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            duration_ms = duration.as_millis() as u64,
            "Job completed"
        );
    }

    fn job_failed(&self, job: &Job, error: &str, duration: Duration) {
        warn!(
            subsystem = "jobs",
            op = "execute",
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            duration_ms = duration.as_millis() as u64,
            error = %error,
            "Job failed"
        );
    }

    fn job_retried(&self, job: &Job, error: &str, retry_after: DateTime<Utc>) {
        debug!(
            subsystem = "jobs",
            op = "retry",
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            retry_after = %retry_after,
            error = %error,
            "Job retry scheduled"
        );
    }

    fn job_cancelled(&self, job_id: Uuid) {
        info!(subsystem = "jobs", op = "cancel", job_id = %job_id, "Job cancelled");
    }

    fn heartbeat(&self, stats: &WorkerStats) {
        debug!(
            subsystem = "jobs",
            op = "heartbeat",
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            retried = stats.retried,
            active = stats.active,
            last_processed_at = ?stats.last_processed_at,
            "Worker heartbeat"
        );
    }

    fn pool_started(&self, worker_ids: &[String]) {
        info!(
            subsystem = "jobs",
            op = "start",
            processors = worker_ids.len(),
            "Worker pool started"
        );
    }

    fn pool_stopped(&self, clean: bool) {
        if clean {
            info!(subsystem = "jobs", op = "stop", "Worker pool stopped");
        } else {
            warn!(subsystem = "jobs", op = "stop", "Worker pool stopped after shutdown timeout");
        }
    }
}

/// Events published by [`EventInstrumentation`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    JobEnqueued {
        job_id: Uuid,
        job_type: String,
    },
    JobStarted {
        job_id: Uuid,
        job_type: String,
        worker_id: String,
        attempts: i32,
    },
    JobCompleted {
        job_id: Uuid,
        job_type: String,
        duration_ms: u64,
    },
    JobFailed {
        job_id: Uuid,
        job_type: String,
        error: String,
    },
    JobRetryScheduled {
        job_id: Uuid,
        job_type: String,
        attempts: i32,
        retry_after: DateTime<Utc>,
        error: String,
    },
    JobCancelled {
        job_id: Uuid,
    },
    Heartbeat(WorkerStats),
    PoolStarted {
        worker_ids: Vec<String>,
    },
    PoolStopped {
        clean: bool,
    },
}

/// Publishes [`WorkerEvent`]s on a broadcast channel.
///
/// Sending never blocks; with no subscribers the event is dropped, and a
/// lagging subscriber loses the oldest events.
#[derive(Debug, Clone)]
pub struct EventInstrumentation {
    tx: broadcast::Sender<WorkerEvent>,
}

impl Default for EventInstrumentation {
    fn default() -> Self {
        Self::new(defaults::EVENT_BUS_CAPACITY)
    }
}

impl EventInstrumentation {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Get a receiver for worker events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Instrumentation for EventInstrumentation {
    fn job_enqueued(&self, job: &Job) {
        self.send(WorkerEvent::JobEnqueued {
            job_id: job.id,
            job_type: job.job_type.clone(),
        });
    }

    fn job_started(&self, job: &Job, worker_id: &str) {
        self.send(WorkerEvent::JobStarted {
            job_id: job.id,
            job_type: job.job_type.clone(),
            worker_id: worker_id.to_string(),
            attempts: job.attempts,
        });
    }

    fn job_completed(&self, job: &Job, duration: Duration) {
        self.send(WorkerEvent::JobCompleted {
            job_id: job.id,
            job_type: job.job_type.clone(),
            duration_ms: duration.as_millis() as u64,
        });
    }

    fn job_failed(&self, job: &Job, error: &str, _duration: Duration) {
        self.send(WorkerEvent::JobFailed {
            job_id: job.id,
            job_type: job.job_type.clone(),
            error: error.to_string(),
        });
    }

    fn job_retried(&self, job: &Job, error: &str, retry_after: DateTime<Utc>) {
        self.send(WorkerEvent::JobRetryScheduled {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempts: job.attempts,
            retry_after,
            error: error.to_string(),
        });
    }

    fn job_cancelled(&self, job_id: Uuid) {
        self.send(WorkerEvent::JobCancelled { job_id });
    }

    fn heartbeat(&self, stats: &WorkerStats) {
        self.send(WorkerEvent::Heartbeat(stats.clone()));
    }

    fn pool_started(&self, worker_ids: &[String]) {
        self.send(WorkerEvent::PoolStarted {
            worker_ids: worker_ids.to_vec(),
        });
    }

    fn pool_stopped(&self, clean: bool) {
        self.send(WorkerEvent::PoolStopped { clean });
    }
}

/// Fans every callback out to several observers, in order.
#[derive(Clone, Default)]
pub struct CompositeInstrumentation {
    observers: Vec<Arc<dyn Instrumentation>>,
}

impl CompositeInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Instrumentation>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Instrumentation for CompositeInstrumentation {
    fn job_enqueued(&self, job: &Job) {
        self.observers.iter().for_each(|o| o.job_enqueued(job));
    }

    fn job_started(&self, job: &Job, worker_id: &str) {
        self.observers.iter().for_each(|o| o.job_started(job, worker_id));
    }

    fn job_completed(&self, job: &Job, duration: Duration) {
        self.observers.iter().for_each(|o| o.job_completed(job, duration));
    }

    fn job_failed(&self, job: &Job, error: &str, duration: Duration) {
        self.observers
            .iter()
            .for_each(|o| o.job_failed(job, error, duration));
    }

    fn job_retried(&self, job: &Job, error: &str, retry_after: DateTime<Utc>) {
        self.observers
            .iter()
            .for_each(|o| o.job_retried(job, error, retry_after));
    }

    fn job_cancelled(&self, job_id: Uuid) {
        self.observers.iter().for_each(|o| o.job_cancelled(job_id));
    }

    fn heartbeat(&self, stats: &WorkerStats) {
        self.observers.iter().for_each(|o| o.heartbeat(stats));
    }

    fn pool_started(&self, worker_ids: &[String]) {
        self.observers.iter().for_each(|o| o.pool_started(worker_ids));
    }

    fn pool_stopped(&self, clean: bool) {
        self.observers.iter().for_each(|o| o.pool_stopped(clean));
    }
}
