//! Job data model shared by every store and the worker pool.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

// =============================================================================
// STATUS
// =============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Terminal statuses, the only ones removed by the cleanup sweep.
    pub const TERMINAL: [JobStatus; 3] = [
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// `cancelled` is reachable only from `pending` or `failed`.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status '{other}'"))),
        }
    }
}

// =============================================================================
// PRIORITY
// =============================================================================

/// Job priority. Only affects claim order, never preempts a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Numeric weight stored with the job and used for ordering.
    pub fn weight(&self) -> i32 {
        match self {
            JobPriority::Low => 25,
            JobPriority::Normal => 50,
            JobPriority::High => 75,
            JobPriority::Critical => 100,
        }
    }

    /// Map a stored weight back to its tier.
    ///
    /// Weights between tiers round down, so a hand-inserted row with
    /// weight 60 reads back as `Normal`.
    pub fn from_weight(weight: i32) -> Self {
        match weight {
            w if w >= 100 => JobPriority::Critical,
            w if w >= 75 => JobPriority::High,
            w if w >= 50 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "critical" => Ok(JobPriority::Critical),
            other => Err(Error::InvalidInput(format!(
                "unknown job priority '{other}'"
            ))),
        }
    }
}

// =============================================================================
// JOB
// =============================================================================

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    /// Opaque document, interpreted only by the handler.
    pub payload: JsonValue,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set only while the job is `processing`.
    pub worker_id: Option<String>,
    /// Free-form auxiliary document, not interpreted by the scheduler.
    pub metadata: JsonValue,
}

impl Job {
    /// Build the initial `pending` record for an enqueue request.
    ///
    /// Stores call this after [`NewJob::validate`] so every backend assigns
    /// the same defaults.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Pending,
            priority: new.priority.unwrap_or_default(),
            attempts: 0,
            max_attempts: new.max_attempts,
            created_at: now,
            updated_at: now,
            scheduled_for: new.scheduled_for,
            retry_after: None,
            processed_at: None,
            completed_at: None,
            last_error: None,
            worker_id: None,
            metadata: new.metadata,
        }
    }

    /// Claim eligibility: pending, and neither scheduling hint lies in the future.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_for.map_or(true, |t| t <= now)
            && self.retry_after.map_or(true, |t| t <= now)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Dispatch order: priority weight descending, then creation time
    /// ascending. Ties fall back to the (time-ordered) id so the order is total.
    pub fn claim_order(a: &Job, b: &Job) -> Ordering {
        b.priority
            .weight()
            .cmp(&a.priority.weight())
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    #[serde(default = "empty_document")]
    pub payload: JsonValue,
    /// Defaults to `normal` when unset.
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default = "empty_document")]
    pub metadata: JsonValue,
}

fn empty_document() -> JsonValue {
    JsonValue::Object(Map::new())
}

fn default_max_attempts() -> i32 {
    defaults::JOB_MAX_ATTEMPTS
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: empty_document(),
            priority: None,
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            scheduled_for: None,
            metadata: empty_document(),
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Make the job ineligible for claiming until `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject requests that must never be persisted.
    pub fn validate(&self) -> Result<()> {
        if self.job_type.trim().is_empty() {
            return Err(Error::InvalidInput("job_type must not be empty".into()));
        }
        if self.max_attempts < 1 {
            return Err(Error::InvalidInput(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        Ok(())
    }
}

// =============================================================================
// STATS
// =============================================================================

/// Job counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl QueueStats {
    pub fn count(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    /// Add one job of `status` to the tally.
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }
}

/// In-process worker counters, read by the heartbeat and the stats accessor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    /// Jobs currently executing in this process.
    pub active: usize,
    pub last_processed_at: Option<DateTime<Utc>>,
}
