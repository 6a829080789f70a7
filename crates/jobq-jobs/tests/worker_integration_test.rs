//! Integration tests for WorkerPool against the in-memory store.
//!
//! This test suite validates:
//! - Retry then fail for handlers that always error
//! - Priority then FIFO dispatch
//! - Cancellation rules while a job is processing
//! - Graceful shutdown releasing in-flight jobs
//! - Shutdown timeout for handlers that ignore cancellation
//! - Missing handlers, panics and per-job timeouts
//! - Heartbeat events and enqueue wake-up
//! - Mutual exclusion across concurrent processors

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobq_db::MemoryJobStore;
use jobq_jobs::{
    handler_fn, Error, EventInstrumentation, JobContext, JobHandler, JobPriority, JobResult,
    JobStatus, JobStore, NewJob, NoOpHandler, WorkerConfig, WorkerEvent, WorkerPool,
};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Fast polling and short backoff so tests finish quickly.
fn test_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_max_concurrent(1)
        .with_poll_interval(Duration::from_millis(20))
        .with_retry_backoff(Duration::from_millis(20), Duration::from_millis(100), 2.0)
        .with_job_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_worker_id_prefix("test")
}

/// Wait for a job to reach a specific status.
async fn wait_for_job_status(
    store: &MemoryJobStore,
    job_id: Uuid,
    expected_status: JobStatus,
    timeout_secs: u64,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if let Ok(Some(job)) = store.get_job(job_id).await {
            if job.status == expected_status {
                return true;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait until `count` jobs are processing.
async fn wait_for_processing(store: &MemoryJobStore, count: usize, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if store.list_processing_jobs().await.unwrap().len() == count {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

fn always_fail() -> impl JobHandler {
    handler_fn(|_ctx: JobContext| async { JobResult::Retry("downstream unavailable".into()) })
}

/// Records the order in which jobs were executed.
struct TrackingHandler {
    executions: Arc<Mutex<Vec<Uuid>>>,
}

impl TrackingHandler {
    fn new() -> (Self, Arc<Mutex<Vec<Uuid>>>) {
        let executions = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                executions: executions.clone(),
            },
            executions,
        )
    }
}

#[async_trait::async_trait]
impl JobHandler for TrackingHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.executions.lock().await.push(ctx.job.id);
        sleep(Duration::from_millis(5)).await;
        JobResult::Success
    }
}

/// Blocks until its context is cancelled.
struct CooperativeHandler;

#[async_trait::async_trait]
impl JobHandler for CooperativeHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        ctx.cancelled().await;
        JobResult::Retry("cancelled".into())
    }
}

/// Sleeps without ever looking at its context.
struct StubbornHandler {
    duration: Duration,
}

#[async_trait::async_trait]
impl JobHandler for StubbornHandler {
    async fn execute(&self, _ctx: JobContext) -> JobResult {
        sleep(self.duration).await;
        JobResult::Success
    }
}

struct PanicHandler;

#[async_trait::async_trait]
impl JobHandler for PanicHandler {
    async fn execute(&self, _ctx: JobContext) -> JobResult {
        panic!("handler exploded")
    }
}

// ============================================================================
// RETRY AND FAILURE
// ============================================================================

#[tokio::test]
async fn test_always_fail_single_attempt_ends_failed() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config())
        .with_handler("always-fail", always_fail())
        .build()
        .unwrap();

    let job = pool
        .enqueue(NewJob::new("always-fail").with_max_attempts(1))
        .await
        .unwrap();
    pool.start().await.unwrap();

    assert!(wait_for_job_status(&store, job.id, JobStatus::Failed, 5).await);
    pool.stop().await.unwrap();

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.worker_id.is_none());
    assert!(!job.last_error.unwrap_or_default().is_empty());

    let stats = pool.stats().await;
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 0);
}

#[tokio::test]
async fn test_always_fail_retries_until_exhausted() {
    let store = MemoryJobStore::new();
    let events = EventInstrumentation::new(64);
    let mut rx = events.subscribe();
    let config = test_config().with_retry_backoff(
        Duration::from_millis(300),
        Duration::from_secs(1),
        2.0,
    );
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(config)
        .with_handler("always-fail", always_fail())
        .with_instrumentation(Arc::new(events))
        .build()
        .unwrap();

    let job = pool
        .enqueue(NewJob::new("always-fail").with_max_attempts(3))
        .await
        .unwrap();
    pool.start().await.unwrap();

    // First failure: back to pending with a future retry time.
    let first_retry = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(WorkerEvent::JobRetryScheduled { job_id, attempts, .. }) = rx.recv().await {
                if job_id == job.id {
                    return attempts;
                }
            }
        }
    })
    .await
    .expect("no retry scheduled");
    assert_eq!(first_retry, 1);

    let pending = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert_eq!(pending.attempts, 1);
    assert!(pending.retry_after.unwrap() > Utc::now());
    assert_eq!(pending.last_error.as_deref(), Some("downstream unavailable"));

    assert!(wait_for_job_status(&store, job.id, JobStatus::Failed, 10).await);
    pool.stop().await.unwrap();

    let failed = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.max_attempts, 3);

    let stats = pool.stats().await;
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config())
        .with_handler(
            "validate",
            handler_fn(|_ctx: JobContext| async { JobResult::Failed("malformed payload".into()) }),
        )
        .build()
        .unwrap();

    let job = pool
        .enqueue(NewJob::new("validate").with_max_attempts(5))
        .await
        .unwrap();
    pool.start().await.unwrap();

    assert!(wait_for_job_status(&store, job.id, JobStatus::Failed, 5).await);
    pool.stop().await.unwrap();

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("malformed payload"));
}

#[tokio::test]
async fn test_missing_handler_fails_immediately() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config().with_restrict_to_registered_types(false))
        .with_handler("noop", NoOpHandler)
        .build()
        .unwrap();

    let job = pool
        .enqueue(NewJob::new("unknown").with_max_attempts(3))
        .await
        .unwrap();
    pool.start().await.unwrap();

    assert!(wait_for_job_status(&store, job.id, JobStatus::Failed, 5).await);
    pool.stop().await.unwrap();

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(
        job.last_error.as_deref(),
        Some("no handler registered for job type 'unknown'")
    );
}

#[tokio::test]
async fn test_handler_panic_is_retried() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config())
        .with_handler("explode", PanicHandler)
        .build()
        .unwrap();

    let job = pool
        .enqueue(NewJob::new("explode").with_max_attempts(2))
        .await
        .unwrap();
    pool.start().await.unwrap();

    assert!(wait_for_job_status(&store, job.id, JobStatus::Failed, 5).await);
    // The pool survives the panic and keeps processing.
    let next = pool
        .enqueue(NewJob::new("explode").with_max_attempts(1))
        .await
        .unwrap();
    assert!(wait_for_job_status(&store, next.id, JobStatus::Failed, 5).await);
    pool.stop().await.unwrap();

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.unwrap().contains("handler exploded"));
}

#[tokio::test]
async fn test_timeout_cancels_job_context() {
    let store = MemoryJobStore::new();
    let observed = Arc::new(Mutex::new(false));
    let flag = observed.clone();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config().with_job_timeout(Duration::from_millis(100)))
        .with_handler(
            "slow",
            handler_fn(move |ctx: JobContext| {
                let flag = flag.clone();
                async move {
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            *flag.lock().await = true;
                            JobResult::Retry("interrupted".into())
                        }
                        _ = sleep(Duration::from_secs(10)) => JobResult::Success,
                    }
                }
            }),
        )
        .build()
        .unwrap();

    let job = pool
        .enqueue(NewJob::new("slow").with_max_attempts(1))
        .await
        .unwrap();
    pool.start().await.unwrap();

    assert!(wait_for_job_status(&store, job.id, JobStatus::Failed, 5).await);
    pool.stop().await.unwrap();

    assert!(*observed.lock().await);
    let job = store.get_job(job.id).await.unwrap().unwrap();
    let error = job.last_error.unwrap();
    assert!(error.contains("timeout"), "{error}");
    assert!(error.contains("interrupted"), "{error}");
}

#[tokio::test]
async fn test_permanent_failure_after_timeout_skips_retries() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config().with_job_timeout(Duration::from_millis(100)))
        .with_handler(
            "slow",
            handler_fn(|ctx: JobContext| async move {
                ctx.cancelled().await;
                JobResult::Failed("upstream rejected request".into())
            }),
        )
        .build()
        .unwrap();

    let job = pool
        .enqueue(NewJob::new("slow").with_max_attempts(3))
        .await
        .unwrap();
    pool.start().await.unwrap();

    assert!(wait_for_job_status(&store, job.id, JobStatus::Failed, 5).await);
    pool.stop().await.unwrap();

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    let error = job.last_error.unwrap();
    assert!(error.contains("timeout"), "{error}");
    assert!(error.contains("upstream rejected request"), "{error}");
}

// ============================================================================
// DISPATCH
// ============================================================================

#[tokio::test]
async fn test_noop_job_completes() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config())
        .with_handler("noop", NoOpHandler)
        .build()
        .unwrap();

    let job = pool
        .enqueue(NewJob::new("noop").with_max_attempts(1))
        .await
        .unwrap();
    pool.start().await.unwrap();

    assert!(wait_for_job_status(&store, job.id, JobStatus::Completed, 5).await);
    pool.stop().await.unwrap();

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert!(job.completed_at.is_some());
    assert!(job.worker_id.is_none());
    assert_eq!(pool.stats().await.succeeded, 1);
    assert_eq!(pool.queue_stats().await.unwrap().completed, 1);
}

#[tokio::test]
async fn test_priority_then_fifo_dispatch() {
    let store = MemoryJobStore::new();
    let (handler, executions) = TrackingHandler::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config())
        .with_handler("track", handler)
        .build()
        .unwrap();

    let low = pool
        .enqueue(NewJob::new("track").with_priority(JobPriority::Low))
        .await
        .unwrap();
    let critical = pool
        .enqueue(NewJob::new("track").with_priority(JobPriority::Critical))
        .await
        .unwrap();
    let first = pool.enqueue(NewJob::new("track")).await.unwrap();
    let second = pool.enqueue(NewJob::new("track")).await.unwrap();

    pool.start().await.unwrap();
    assert!(wait_for_job_status(&store, low.id, JobStatus::Completed, 5).await);
    pool.stop().await.unwrap();

    assert_eq!(
        *executions.lock().await,
        vec![critical.id, first.id, second.id, low.id]
    );
}

#[tokio::test]
async fn test_concurrent_processors_never_double_claim() {
    let store = MemoryJobStore::new();
    let (handler, executions) = TrackingHandler::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config().with_max_concurrent(4))
        .with_handler("track", handler)
        .build()
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..20 {
        let job = pool
            .enqueue(NewJob::new("track").with_payload(json!({ "n": i })))
            .await
            .unwrap();
        ids.push(job.id);
    }
    pool.start().await.unwrap();

    for id in &ids {
        assert!(wait_for_job_status(&store, *id, JobStatus::Completed, 10).await);
    }
    pool.stop().await.unwrap();

    let executed = executions.lock().await;
    let unique: HashSet<Uuid> = executed.iter().copied().collect();
    assert_eq!(executed.len(), 20);
    assert_eq!(unique.len(), 20);
    assert_eq!(pool.stats().await.processed, 20);
}

#[tokio::test]
async fn test_unregistered_types_are_left_alone() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config())
        .with_handler("email", NoOpHandler)
        .build()
        .unwrap();

    let sms = pool.enqueue(NewJob::new("sms")).await.unwrap();
    let email = pool.enqueue(NewJob::new("email")).await.unwrap();
    pool.start().await.unwrap();

    assert!(wait_for_job_status(&store, email.id, JobStatus::Completed, 5).await);
    sleep(Duration::from_millis(100)).await;
    pool.stop().await.unwrap();

    let sms = store.get_job(sms.id).await.unwrap().unwrap();
    assert_eq!(sms.status, JobStatus::Pending);
    assert_eq!(sms.attempts, 0);
}

#[tokio::test]
async fn test_enqueue_wakes_idle_processor() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config().with_poll_interval(Duration::from_secs(30)))
        .with_handler("noop", NoOpHandler)
        .build()
        .unwrap();

    pool.start().await.unwrap();
    // Let the processor find the queue empty and start waiting.
    sleep(Duration::from_millis(100)).await;

    let job = pool.enqueue(NewJob::new("noop")).await.unwrap();
    assert!(wait_for_job_status(&store, job.id, JobStatus::Completed, 2).await);
    pool.stop().await.unwrap();
}

// ============================================================================
// CANCELLATION AND SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_cancel_processing_job_is_rejected() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config())
        .with_handler("block", CooperativeHandler)
        .build()
        .unwrap();

    let running = pool.enqueue(NewJob::new("block")).await.unwrap();
    pool.start().await.unwrap();
    assert!(wait_for_processing(&store, 1, 5).await);

    let err = pool.cancel_job(running.id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CannotCancel {
            status: JobStatus::Processing,
            ..
        }
    ));
    assert_eq!(
        store.get_job(running.id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );

    let waiting = pool
        .enqueue(NewJob::new("block").scheduled_for(Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();
    pool.cancel_job(waiting.id).await.unwrap();
    assert_eq!(
        store.get_job(waiting.id).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_releases_in_flight_jobs() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config().with_max_concurrent(2))
        .with_handler("block", CooperativeHandler)
        .build()
        .unwrap();

    let a = pool.enqueue(NewJob::new("block")).await.unwrap();
    let b = pool.enqueue(NewJob::new("block")).await.unwrap();
    pool.start().await.unwrap();
    assert!(wait_for_processing(&store, 2, 5).await);

    pool.stop().await.unwrap();

    for id in [a.id, b.id] {
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());
        assert_eq!(job.attempts, 1);
        assert!(job.retry_after.is_none());
    }
    let stats = pool.stats().await;
    assert_eq!(stats.active, 0);
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn test_stop_reports_shutdown_timeout() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config().with_shutdown_timeout(Duration::from_millis(100)))
        .with_handler(
            "stubborn",
            StubbornHandler {
                duration: Duration::from_secs(2),
            },
        )
        .build()
        .unwrap();

    let job = pool.enqueue(NewJob::new("stubborn")).await.unwrap();
    pool.start().await.unwrap();
    assert!(wait_for_processing(&store, 1, 5).await);

    let err = pool.stop().await.unwrap_err();
    assert!(matches!(err, Error::ShutdownTimeout(d) if d == Duration::from_millis(100)));

    // The release is not undone by the timeout.
    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_parent_token_stops_polling() {
    let store = MemoryJobStore::new();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config())
        .with_handler("noop", NoOpHandler)
        .build()
        .unwrap();

    let parent = CancellationToken::new();
    pool.start_with(parent.clone()).await.unwrap();
    let before = pool.enqueue(NewJob::new("noop")).await.unwrap();
    assert!(wait_for_job_status(&store, before.id, JobStatus::Completed, 5).await);

    parent.cancel();
    sleep(Duration::from_millis(100)).await;
    let after = pool.enqueue(NewJob::new("noop")).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        store.get_job(after.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    pool.stop().await.unwrap();
}

// ============================================================================
// INSTRUMENTATION
// ============================================================================

#[tokio::test]
async fn test_lifecycle_events_and_heartbeat() {
    let store = MemoryJobStore::new();
    let events = EventInstrumentation::new(64);
    let mut rx = events.subscribe();
    let pool = WorkerPool::builder(Arc::new(store.clone()))
        .with_config(test_config().with_heartbeat_interval(Duration::from_millis(50)))
        .with_handler("noop", NoOpHandler)
        .with_instrumentation(Arc::new(events))
        .build()
        .unwrap();

    pool.start().await.unwrap();
    let job = pool.enqueue(NewJob::new("noop")).await.unwrap();

    let mut seen_started = false;
    let mut seen_completed = false;
    let mut heartbeat = None;
    let collected = timeout(Duration::from_secs(5), async {
        while let Ok(event) = rx.recv().await {
            match event {
                WorkerEvent::JobStarted { job_id, worker_id, .. } if job_id == job.id => {
                    assert_eq!(worker_id, "test-1");
                    seen_started = true;
                }
                WorkerEvent::JobCompleted { job_id, .. } if job_id == job.id => {
                    seen_completed = true;
                }
                WorkerEvent::Heartbeat(stats) if seen_completed => {
                    heartbeat = Some(stats);
                    break;
                }
                _ => {}
            }
        }
    })
    .await;

    assert!(collected.is_ok());
    assert!(seen_started);
    assert!(seen_completed);
    let heartbeat = heartbeat.unwrap();
    assert_eq!(heartbeat.succeeded, 1);
    assert!(heartbeat.last_processed_at.is_some());

    pool.stop().await.unwrap();
    let stopped = timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(WorkerEvent::PoolStopped { clean }) = rx.recv().await {
                return clean;
            }
        }
    })
    .await;
    assert_eq!(stopped.ok(), Some(true));
}
