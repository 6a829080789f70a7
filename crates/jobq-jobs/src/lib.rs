//! # jobq-jobs
//!
//! Worker pool executor for the jobq job queue.
//!
//! This crate provides:
//! - A pool of concurrent processors claiming jobs from any [`JobStore`]
//! - Per-job deadlines delivered through a cancellation token
//! - Exponential backoff with jitter for failed attempts
//! - Graceful shutdown that returns in-flight jobs to the queue
//! - Lifecycle instrumentation via `tracing` or a broadcast event stream
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use jobq_db::Database;
//! use jobq_jobs::{handler_fn, JobContext, JobResult, NewJob, WorkerConfig, WorkerPool};
//!
//! let db = Database::connect("postgres://...").await?;
//!
//! let pool = WorkerPool::builder(Arc::new(db.jobs.clone()))
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler("send_invoice", handler_fn(|ctx: JobContext| async move {
//!         send_invoice(ctx.payload()).await.into()
//!     }))
//!     .build()?;
//!
//! pool.start().await?;
//! pool.enqueue(NewJob::new("send_invoice")).await?;
//!
//! // Graceful shutdown
//! pool.stop().await?;
//! ```

pub mod config;
pub mod handler;
pub mod instrumentation;
pub mod retry;
pub mod worker;

// Re-export core types
pub use jobq_core::*;

pub use config::WorkerConfig;
pub use handler::{handler_fn, FnHandler, HandlerRegistry, JobContext, JobHandler, JobResult, NoOpHandler};
pub use instrumentation::{
    CompositeInstrumentation, EventInstrumentation, Instrumentation, LogInstrumentation,
    NoopInstrumentation, WorkerEvent,
};
pub use retry::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolBuilder};
