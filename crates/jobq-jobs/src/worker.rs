//! Worker pool: concurrent processors that claim and execute jobs.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use jobq_core::{defaults, Error, Job, JobStore, NewJob, QueueStats, Result, WorkerStats};

use crate::handler::{HandlerRegistry, JobContext, JobHandler, JobResult};
use crate::instrumentation::{Instrumentation, LogInstrumentation};
use crate::retry::RetryPolicy;
use crate::WorkerConfig;

/// Pool of concurrent job processors sharing one [`JobStore`].
///
/// Built once through [`WorkerPoolBuilder`]; the handler registry is frozen
/// at build time. A pool runs at most once: `start`, then `stop`.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    started: AtomicBool,
    running: Mutex<Option<RunState>>,
}

/// Handles owned by a started pool.
struct RunState {
    stop: CancellationToken,
    tasks: JoinSet<()>,
}

/// State shared by every processor task.
struct PoolInner {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    handlers: HandlerRegistry,
    instrumentation: Arc<dyn Instrumentation>,
    retry: RetryPolicy,
    /// Types passed to the claim; empty means any type.
    claim_types: Vec<String>,
    worker_ids: Vec<String>,
    /// Executing jobs, keyed by job id.
    active: Mutex<HashMap<Uuid, ActiveJob>>,
    stats: RwLock<WorkerStats>,
    /// Set once `stop` begins; processors then leave outcomes to release.
    stopping: AtomicBool,
}

/// An executing job: the processor holding it and its cancellation handle.
#[derive(Clone)]
struct ActiveJob {
    worker_id: String,
    token: CancellationToken,
}

impl WorkerPool {
    pub fn builder(store: Arc<dyn JobStore>) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(store)
    }

    /// Start the processors and the heartbeat. Returns immediately.
    pub async fn start(&self) -> Result<()> {
        self.start_with(CancellationToken::new()).await
    }

    /// Start the pool under a caller-owned token.
    ///
    /// Cancelling `parent` stops polling and cancels in-flight job contexts
    /// like [`stop`](Self::stop) does, but does not release jobs.
    pub async fn start_with(&self, parent: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let inner = &self.inner;
        if !inner.config.enabled {
            info!(subsystem = "jobs", op = "start", "Worker pool is disabled, not starting");
            return Ok(());
        }

        let stop = parent.child_token();
        let mut tasks = JoinSet::new();
        for worker_id in &inner.worker_ids {
            tasks.spawn(inner.clone().run_processor(worker_id.clone(), stop.clone()));
        }
        tasks.spawn(inner.clone().run_heartbeat(stop.clone()));
        inner.instrumentation.pool_started(&inner.worker_ids);

        *self.running.lock().await = Some(RunState { stop, tasks });
        Ok(())
    }

    /// Graceful shutdown.
    ///
    /// Stops new claims, cancels every executing job, returns each of them to
    /// `pending` through [`JobStore::release_job`], then waits up to
    /// `shutdown_timeout` for the processors to exit. A no-op when the pool
    /// was never started or has already stopped.
    pub async fn stop(&self) -> Result<()> {
        let Some(RunState { stop, mut tasks }) = self.running.lock().await.take() else {
            return Ok(());
        };
        let inner = &self.inner;

        inner.stopping.store(true, Ordering::SeqCst);
        let in_flight: Vec<(Uuid, ActiveJob)> = inner
            .active
            .lock()
            .await
            .iter()
            .map(|(id, job)| (*id, job.clone()))
            .collect();

        info!(
            subsystem = "jobs",
            op = "stop",
            in_flight = in_flight.len(),
            "Stopping worker pool"
        );

        stop.cancel();
        for (_, job) in &in_flight {
            job.token.cancel();
        }

        for (job_id, job) in &in_flight {
            match inner.store.release_job(*job_id, &job.worker_id).await {
                Ok(()) => debug!(subsystem = "jobs", op = "release", job_id = %job_id, "Released in-flight job"),
                Err(e) => warn!(
                    subsystem = "jobs",
                    op = "release",
                    job_id = %job_id,
                    error = %e,
                    "Failed to release in-flight job"
                ),
            }
        }

        let drain = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(subsystem = "jobs", op = "stop", error = ?e, "Worker task panicked");
                }
            }
        };

        match tokio::time::timeout(inner.config.shutdown_timeout, drain).await {
            Ok(()) => {
                inner.instrumentation.pool_stopped(true);
                Ok(())
            }
            Err(_) => {
                // Handlers that ignore cancellation keep running to completion.
                tasks.detach_all();
                inner.instrumentation.pool_stopped(false);
                Err(Error::ShutdownTimeout(inner.config.shutdown_timeout))
            }
        }
    }

    /// Validate and persist a job, then notify the instrumentation.
    pub async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let job = self.inner.store.enqueue(job).await?;
        self.inner.instrumentation.job_enqueued(&job);
        Ok(job)
    }

    /// Cancel a `pending` or `failed` job.
    pub async fn cancel_job(&self, id: Uuid) -> Result<()> {
        self.inner.store.cancel_job(id).await?;
        self.inner.instrumentation.job_cancelled(id);
        Ok(())
    }

    /// Job counts by status, straight from the store.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.inner.store.get_stats().await
    }

    /// Up to `LIST_PENDING_LIMIT` pending jobs, in dispatch order.
    pub async fn pending_jobs(&self) -> Result<Vec<Job>> {
        self.inner
            .store
            .list_pending_jobs(defaults::LIST_PENDING_LIMIT)
            .await
    }

    /// Jobs currently held by any processor, in this process or another.
    pub async fn processing_jobs(&self) -> Result<Vec<Job>> {
        self.inner.store.list_processing_jobs().await
    }

    /// In-process worker counters.
    pub async fn stats(&self) -> WorkerStats {
        self.inner.stats.read().await.clone()
    }

    /// Processor identities, one per concurrency slot.
    pub fn worker_ids(&self) -> &[String] {
        &self.inner.worker_ids
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        self.inner.handlers.job_types()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.inner.store.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

impl PoolInner {
    /// Claim and execute jobs until `stop` is cancelled.
    #[instrument(skip(self, stop), fields(subsystem = "jobs", component = "processor"))]
    async fn run_processor(self: Arc<Self>, worker_id: String, stop: CancellationToken) {
        debug!("Processor started");
        let notify = self.store.job_notify();

        while !stop.is_cancelled() {
            // Registered before the claim so an enqueue racing with it still wakes us.
            let notified = notify.notified();

            match self.claim(&worker_id).await {
                Some(job) => self.execute_job(&worker_id, job, &stop).await,
                None => {
                    trace!("No eligible job, waiting");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = notified => trace!("Woken by job notification"),
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        debug!("Processor stopped");
    }

    /// Claim the next job; store errors count as "no job this tick".
    async fn claim(&self, worker_id: &str) -> Option<Job> {
        match self
            .store
            .claim_next_job_for_types(worker_id, &self.claim_types)
            .await
        {
            Ok(job) => job,
            Err(e) if e.is_infrastructure() => {
                error!(subsystem = "jobs", op = "claim", worker_id, error = %e, "Failed to claim job");
                None
            }
            Err(e) => {
                warn!(subsystem = "jobs", op = "claim", worker_id, error = %e, "Failed to claim job");
                None
            }
        }
    }

    /// Execute a single claimed job and record its outcome.
    async fn execute_job(&self, worker_id: &str, job: Job, stop: &CancellationToken) {
        let token = stop.child_token();
        {
            let mut active = self.active.lock().await;
            // Checked under the lock `stop` snapshots with, so every job is
            // either in the snapshot or released here.
            if self.stopping.load(Ordering::SeqCst) {
                drop(active);
                if let Err(e) = self.store.release_job(job.id, worker_id).await {
                    warn!(subsystem = "jobs", op = "release", job_id = %job.id, error = %e, "Failed to release job claimed during shutdown");
                }
                return;
            }
            active.insert(
                job.id,
                ActiveJob {
                    worker_id: worker_id.to_string(),
                    token: token.clone(),
                },
            );
        }
        self.stats.write().await.active += 1;

        self.instrumentation.job_started(&job, worker_id);
        let start = Instant::now();

        let result = match self.handlers.get(&job.job_type) {
            Some(handler) => self.run_handler(handler, &job, token).await,
            None => JobResult::Failed(format!(
                "no handler registered for job type '{}'",
                job.job_type
            )),
        };

        self.active.lock().await.remove(&job.id);
        self.stats.write().await.active -= 1;

        self.finish(worker_id, job, result, start.elapsed()).await;
    }

    /// Run the handler under the job deadline, catching panics.
    ///
    /// Expiry cancels the context; the handler is still awaited, since a
    /// handler that ignores its context cannot be interrupted safely.
    async fn run_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        job: &Job,
        token: CancellationToken,
    ) -> JobResult {
        let timeout = self.config.job_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let ctx = JobContext::new(job.clone(), token.clone(), deadline);

        let fut = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();
        tokio::pin!(fut);

        let mut timed_out = false;
        let outcome = match tokio::time::timeout(timeout, &mut fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                timed_out = true;
                warn!(
                    subsystem = "jobs",
                    op = "execute",
                    job_id = %job.id,
                    job_type = %job.job_type,
                    timeout_secs = timeout.as_secs_f64(),
                    "Job exceeded timeout, cancelling context"
                );
                token.cancel();
                fut.await
            }
        };

        match outcome {
            Ok(JobResult::Success) => JobResult::Success,
            Ok(JobResult::Failed(reason)) if timed_out => {
                JobResult::Failed(format!("job exceeded timeout of {timeout:?}: {reason}"))
            }
            Ok(JobResult::Retry(reason)) if timed_out => {
                JobResult::Retry(format!("job exceeded timeout of {timeout:?}: {reason}"))
            }
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    subsystem = "jobs",
                    op = "execute",
                    job_id = %job.id,
                    job_type = %job.job_type,
                    panic = %message,
                    "Job handler panicked"
                );
                JobResult::Retry(format!("handler panicked: {message}"))
            }
        }
    }

    /// Apply the state transition for a finished execution.
    async fn finish(&self, worker_id: &str, job: Job, result: JobResult, elapsed: Duration) {
        if self.stopping.load(Ordering::SeqCst) {
            debug!(
                subsystem = "jobs",
                job_id = %job.id,
                "Pool stopping, leaving job for release"
            );
            return;
        }

        let transition = match &result {
            JobResult::Success => self.store.mark_completed(job.id, worker_id).await,
            JobResult::Retry(message) if job.has_attempts_remaining() => {
                let retry_after = self.retry.retry_after(Utc::now(), job.attempts);
                let scheduled = self
                    .store
                    .schedule_retry(job.id, worker_id, message, retry_after)
                    .await;
                if scheduled.is_ok() {
                    self.instrumentation.job_retried(&job, message, retry_after);
                }
                scheduled
            }
            JobResult::Retry(message) | JobResult::Failed(message) => {
                self.store.mark_failed(job.id, worker_id, message).await
            }
        };

        if let Err(e) = transition {
            let level_error = e.is_infrastructure();
            if level_error {
                error!(subsystem = "jobs", job_id = %job.id, error = %e, "Failed to record job outcome");
            } else {
                warn!(subsystem = "jobs", job_id = %job.id, error = %e, "Failed to record job outcome");
            }
        }

        let mut stats = self.stats.write().await;
        stats.processed += 1;
        stats.last_processed_at = Some(Utc::now());
        match result {
            JobResult::Success => {
                stats.succeeded += 1;
                drop(stats);
                self.instrumentation.job_completed(&job, elapsed);
            }
            JobResult::Retry(_) if job.has_attempts_remaining() => {
                stats.retried += 1;
            }
            JobResult::Retry(message) | JobResult::Failed(message) => {
                stats.failed += 1;
                drop(stats);
                self.instrumentation.job_failed(&job, &message, elapsed);
            }
        }
    }

    /// Emit aggregate counters every `heartbeat_interval` until stopped.
    async fn run_heartbeat(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.stats.read().await.clone();
                    self.instrumentation.heartbeat(&stats);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Builder for a [`WorkerPool`].
pub struct WorkerPoolBuilder {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    handlers: HandlerRegistry,
    instrumentation: Arc<dyn Instrumentation>,
}

impl WorkerPoolBuilder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: WorkerConfig::default(),
            handlers: HandlerRegistry::new(),
            instrumentation: Arc::new(LogInstrumentation),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler for a job type.
    pub fn with_handler<H: JobHandler + 'static>(
        mut self,
        job_type: impl Into<String>,
        handler: H,
    ) -> Self {
        self.handlers.register(job_type, Arc::new(handler));
        self
    }

    /// Register an already shared handler.
    pub fn with_shared_handler(
        mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        self.handlers.register(job_type, handler);
        self
    }

    /// Replace the default [`LogInstrumentation`].
    pub fn with_instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Validate the configuration and freeze the handler registry.
    pub fn build(self) -> Result<WorkerPool> {
        self.config.validate()?;

        let claim_types = if self.config.restrict_to_registered_types {
            if self.handlers.is_empty() {
                return Err(Error::Config(
                    "restrict_to_registered_types is set but no handlers are registered".into(),
                ));
            }
            self.handlers.job_types()
        } else {
            Vec::new()
        };

        let worker_ids = (1..=self.config.max_concurrent)
            .map(|slot| format!("{}-{}", self.config.worker_id_prefix, slot))
            .collect();

        debug!(
            subsystem = "jobs",
            processors = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            job_timeout_secs = self.config.job_timeout.as_secs(),
            job_types = ?self.handlers.job_types(),
            claim_types = ?claim_types,
            "Built worker pool"
        );

        Ok(WorkerPool {
            inner: Arc::new(PoolInner {
                retry: RetryPolicy::from(&self.config),
                store: self.store,
                config: self.config,
                handlers: self.handlers,
                instrumentation: self.instrumentation,
                claim_types,
                worker_ids,
                active: Mutex::new(HashMap::new()),
                stats: RwLock::new(WorkerStats::default()),
                stopping: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }
}
