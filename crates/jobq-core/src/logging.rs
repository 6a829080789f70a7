//! Structured logging field names shared by every jobq crate.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Store/infrastructure failure, requires operator attention |
//! | WARN  | Job failure, job timeout, shutdown timeout |
//! | INFO  | Lifecycle events (pool start/stop), job enqueued/completed |
//! | DEBUG | Claim misses, retries scheduled, heartbeat |
//! | TRACE | Poll ticks |

/// Subsystem originating the log event.
/// Values: "db", "jobs", "maintenance"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "store", "processor", "heartbeat", "maintenance"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim_next", "enqueue", "release", "cleanup"
pub const OPERATION: &str = "op";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type key.
pub const JOB_TYPE: &str = "job_type";

/// Identity of the processor holding a job.
pub const WORKER_ID: &str = "worker_id";

/// Attempt counter of a job.
pub const ATTEMPTS: &str = "attempts";

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of rows affected by a maintenance query.
pub const ROWS_AFFECTED: &str = "rows_affected";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
