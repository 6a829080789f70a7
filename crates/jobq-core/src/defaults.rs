//! Centralized default constants for jobq.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates and the worker binary reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// ENQUEUE
// =============================================================================

/// Default attempt ceiling for a new job.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

// =============================================================================
// WORKER POOL
// =============================================================================

/// Default number of concurrent processors per pool.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default idle wait between claim attempts in milliseconds.
///
/// Enqueues in the same process wake idle processors immediately; this
/// interval bounds how long a job enqueued by another process can wait.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Default per-job execution deadline in seconds (5 minutes).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Default upper bound on graceful shutdown in seconds.
pub const JOB_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default heartbeat emission interval in seconds.
pub const JOB_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// RETRY
// =============================================================================

/// Delay before the first retry in milliseconds.
pub const JOB_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Cap on any retry delay in milliseconds (5 minutes).
pub const JOB_RETRY_MAX_DELAY_MS: u64 = 300_000;

/// Growth factor applied per attempt.
pub const JOB_RETRY_MULTIPLIER: f64 = 2.0;

/// Lower bound of the jitter factor applied to the base delay.
pub const JOB_RETRY_JITTER_MIN: f64 = 0.8;

/// Upper bound of the jitter factor applied to the base delay.
pub const JOB_RETRY_JITTER_MAX: f64 = 1.2;

// =============================================================================
// MAINTENANCE
// =============================================================================

/// How often the worker binary runs the cleanup sweep, in seconds.
pub const JOB_CLEANUP_INTERVAL_SECS: u64 = 3_600;

/// Retention window for terminal jobs, in hours (7 days).
pub const JOB_RETENTION_HOURS: u64 = 168;

/// Default row limit for diagnostic pending listings.
pub const LIST_PENDING_LIMIT: i64 = 100;

/// `last_error` recorded when stale recovery fails a job on its last attempt.
pub const STALE_JOB_ERROR: &str = "stale: worker lost";
