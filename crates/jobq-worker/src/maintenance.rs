//! Periodic store housekeeping: retention cleanup and stale-job recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use jobq_core::{defaults, JobStore};

/// Maintenance schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    /// How often the sweep runs.
    pub interval: Duration,
    /// Terminal jobs older than this are deleted.
    pub retention: Duration,
    /// Processing jobs claimed longer ago than this return to pending.
    /// `None` disables recovery.
    pub stale_after: Option<Duration>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(defaults::JOB_CLEANUP_INTERVAL_SECS),
            retention: Duration::from_secs(defaults::JOB_RETENTION_HOURS * 3600),
            stale_after: None,
        }
    }
}

impl MaintenanceConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `JOB_CLEANUP_INTERVAL_SECS` | `3600` |
    /// | `JOB_RETENTION_HOURS` | `168` |
    /// | `JOB_STALE_AFTER_SECS` | `0` (disabled) |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());

        Self {
            interval: secs("JOB_CLEANUP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            retention: secs("JOB_RETENTION_HOURS")
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or(defaults.retention),
            stale_after: secs("JOB_STALE_AFTER_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
        }
    }
}

/// Outcome of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: u64,
    pub recovered: u64,
}

/// Run one sweep. Store errors are logged and counted as zero.
pub async fn sweep(store: &dyn JobStore, config: &MaintenanceConfig) -> SweepReport {
    let mut report = SweepReport::default();

    match store.cleanup_old_jobs(config.retention).await {
        Ok(removed) => report.removed = removed,
        Err(e) => error!(subsystem = "maintenance", op = "cleanup", error = %e, "Job cleanup failed"),
    }

    if let Some(stale_after) = config.stale_after {
        match store.recover_stale_jobs(stale_after).await {
            Ok(recovered) => report.recovered = recovered,
            Err(e) => error!(subsystem = "maintenance", op = "recover", error = %e, "Stale job recovery failed"),
        }
    }

    if report.removed > 0 || report.recovered > 0 {
        info!(
            subsystem = "maintenance",
            removed = report.removed,
            recovered = report.recovered,
            "Maintenance sweep finished"
        );
    } else {
        debug!(subsystem = "maintenance", "Maintenance sweep found nothing to do");
    }
    report
}

/// Sweep every `config.interval` until `shutdown` is cancelled.
pub async fn run(store: Arc<dyn JobStore>, config: MaintenanceConfig, shutdown: CancellationToken) {
    info!(
        subsystem = "maintenance",
        interval_secs = config.interval.as_secs(),
        retention_hours = config.retention.as_secs() / 3600,
        stale_after_secs = config.stale_after.map(|d| d.as_secs()),
        "Maintenance loop started"
    );

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                sweep(store.as_ref(), &config).await;
            }
        }
    }

    debug!(subsystem = "maintenance", "Maintenance loop stopped");
}
