//! Job handlers and the registry that maps job types to them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use jobq_core::Job;

/// Context provided to job handlers.
///
/// The token is cancelled when the job's deadline passes, when the pool
/// shuts down, or when the pool's parent token is cancelled. Long-running
/// handlers should watch it and return promptly.
pub struct JobContext {
    /// The job being processed, as returned by the claim.
    pub job: Job,
    token: CancellationToken,
    deadline: Instant,
}

impl JobContext {
    pub fn new(job: Job, token: CancellationToken, deadline: Instant) -> Self {
        Self {
            job,
            token,
            deadline,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// Get the job payload.
    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Attempt number of this execution, starting at 1.
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the job must stop.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A clone of the cancellation token, for handing to spawned subtasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully.
    Success,
    /// Job failed with a transient error; retried while attempts remain.
    Retry(String),
    /// Job failed permanently; never retried.
    Failed(String),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }

    /// The error message, for non-success outcomes.
    pub fn error(&self) -> Option<&str> {
        match self {
            JobResult::Success => None,
            JobResult::Retry(e) | JobResult::Failed(e) => Some(e),
        }
    }
}

/// Errors from a plain `Result` are treated as transient.
impl<E: fmt::Display> From<Result<(), E>> for JobResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`JobHandler`].
///
/// ```rust,ignore
/// let handler = handler_fn(|ctx: JobContext| async move {
///     send_email(ctx.payload()).await.into()
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn execute(&self, ctx: JobContext) -> JobResult {
        (self.f)(ctx).await
    }
}

/// No-op handler for testing.
pub struct NoOpHandler;

#[async_trait]
impl JobHandler for NoOpHandler {
    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success
    }
}

/// Map from job type to handler. Frozen once the pool is built.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any earlier registration.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
