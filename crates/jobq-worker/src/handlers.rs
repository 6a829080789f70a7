//! Built-in handlers, useful for smoke-testing a deployment.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use jobq_jobs::{JobContext, JobHandler, JobResult, NoOpHandler, WorkerPoolBuilder};

/// Sleeps for `payload.duration_ms` (default 1000), ending early on cancellation.
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let millis = ctx
            .payload()
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(1000);

        tokio::select! {
            _ = ctx.cancelled() => JobResult::Retry("interrupted before sleep finished".into()),
            _ = tokio::time::sleep(Duration::from_millis(millis)) => JobResult::Success,
        }
    }
}

/// Logs the payload at INFO.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        info!(
            subsystem = "jobs",
            job_id = %ctx.job_id(),
            attempts = ctx.attempt(),
            payload = %ctx.payload(),
            "Echo job"
        );
        JobResult::Success
    }
}

/// Register the built-in job types.
pub fn register(builder: WorkerPoolBuilder) -> WorkerPoolBuilder {
    builder
        .with_handler("noop", NoOpHandler)
        .with_handler("echo", EchoHandler)
        .with_handler("sleep", SleepHandler)
}
