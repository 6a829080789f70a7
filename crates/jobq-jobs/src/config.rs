//! Worker pool configuration.

use std::time::Duration;

use jobq_core::{defaults, Error, Result};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether to enable job processing at all.
    pub enabled: bool,
    /// Number of concurrent processors.
    pub max_concurrent: usize,
    /// Idle wait between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Delay before the first retry.
    pub retry_base_delay: Duration,
    /// Cap on any retry delay.
    pub retry_max_delay: Duration,
    /// Growth factor per attempt; must be greater than 1.
    pub retry_backoff_multiplier: f64,
    /// Per-job execution deadline.
    pub job_timeout: Duration,
    /// Upper bound on how long `stop` waits for processors to exit.
    pub shutdown_timeout: Duration,
    /// Interval between heartbeat emissions.
    pub heartbeat_interval: Duration,
    /// Only claim job types that have a registered handler.
    pub restrict_to_registered_types: bool,
    /// Prefix for processor identities; processor `n` is `<prefix>-<n>`.
    pub worker_id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: defaults::JOB_MAX_CONCURRENT,
            poll_interval: Duration::from_millis(defaults::JOB_POLL_INTERVAL_MS),
            retry_base_delay: Duration::from_millis(defaults::JOB_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(defaults::JOB_RETRY_MAX_DELAY_MS),
            retry_backoff_multiplier: defaults::JOB_RETRY_MULTIPLIER,
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(defaults::JOB_SHUTDOWN_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(defaults::JOB_HEARTBEAT_INTERVAL_SECS),
            restrict_to_registered_types: true,
            worker_id_prefix: default_worker_id_prefix(),
        }
    }
}

fn default_worker_id_prefix() -> String {
    format!("worker-{}", std::process::id())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v != "false" && v != "0")
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Processor count (min 1) |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Idle wait when the queue is empty |
    /// | `JOB_RETRY_BASE_DELAY_MS` | `1000` | First retry delay |
    /// | `JOB_RETRY_MAX_DELAY_MS` | `300000` | Retry delay cap |
    /// | `JOB_RETRY_MULTIPLIER` | `2.0` | Backoff growth factor |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job deadline |
    /// | `JOB_SHUTDOWN_TIMEOUT_SECS` | `30` | Graceful shutdown bound |
    /// | `JOB_HEARTBEAT_INTERVAL_SECS` | `30` | Heartbeat interval |
    /// | `JOB_RESTRICT_TYPES` | `true` | Claim only registered job types |
    /// | `JOB_WORKER_ID` | `worker-<pid>` | Processor id prefix |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            enabled: env_flag("JOB_WORKER_ENABLED").unwrap_or(defaults.enabled),
            max_concurrent: env_parse::<usize>("JOB_MAX_CONCURRENT")
                .unwrap_or(defaults.max_concurrent)
                .max(1),
            poll_interval: env_parse("JOB_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            retry_base_delay: env_parse("JOB_RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_parse("JOB_RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            retry_backoff_multiplier: env_parse("JOB_RETRY_MULTIPLIER")
                .unwrap_or(defaults.retry_backoff_multiplier),
            job_timeout: env_parse("JOB_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            shutdown_timeout: env_parse("JOB_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            heartbeat_interval: env_parse("JOB_HEARTBEAT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            restrict_to_registered_types: env_flag("JOB_RESTRICT_TYPES")
                .unwrap_or(defaults.restrict_to_registered_types),
            worker_id_prefix: std::env::var("JOB_WORKER_ID")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.worker_id_prefix),
        }
    }

    /// Reject settings the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".into()));
        }
        if !(self.retry_backoff_multiplier > 1.0) || !self.retry_backoff_multiplier.is_finite() {
            return Err(Error::Config(format!(
                "retry_backoff_multiplier must be a finite value greater than 1, got {}",
                self.retry_backoff_multiplier
            )));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::Config(format!(
                "retry_base_delay ({:?}) exceeds retry_max_delay ({:?})",
                self.retry_base_delay, self.retry_max_delay
            )));
        }
        let zero = [
            ("poll_interval", self.poll_interval),
            ("job_timeout", self.job_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
        ]
        .into_iter()
        .find(|(_, d)| d.is_zero());
        if let Some((name, _)) = zero {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        Ok(())
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the number of concurrent processors.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set base delay, cap and multiplier of the retry backoff.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration, multiplier: f64) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self.retry_backoff_multiplier = multiplier;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_restrict_to_registered_types(mut self, restrict: bool) -> Self {
        self.restrict_to_registered_types = restrict;
        self
    }

    pub fn with_worker_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_id_prefix = prefix.into();
        self
    }
}
