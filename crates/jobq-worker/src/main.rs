//! jobq worker process.
//!
//! Connects to PostgreSQL, applies migrations, runs a worker pool with the
//! built-in handlers plus the maintenance loop, and shuts down gracefully on
//! Ctrl+C or SIGTERM.

mod handlers;
mod maintenance;

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobq_db::{log_pool_metrics, Database, JobStore, PoolConfig};
use jobq_jobs::{WorkerConfig, WorkerPool};
use maintenance::MaintenanceConfig;

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "jobq_worker=info,jobq_jobs=info,jobq_db=info")
fn init_logging() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "jobq_worker=info,jobq_jobs=info,jobq_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("jobq-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            // No ANSI in files unless asked for.
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received terminate signal, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;
    db.migrate().await.context("failed to run migrations")?;
    info!(subsystem = "db", "Migrations applied");

    let store: Arc<dyn JobStore> = Arc::new(db.jobs.clone());
    let worker_config = WorkerConfig::from_env();
    let pool = handlers::register(WorkerPool::builder(store.clone()).with_config(worker_config))
        .build()
        .context("invalid worker configuration")?;

    info!(
        job_types = ?pool.job_types(),
        processors = pool.worker_ids().len(),
        "Worker pool configured"
    );

    match (pool.pending_jobs().await, pool.processing_jobs().await) {
        (Ok(pending), Ok(processing)) => info!(
            pending = pending.len(),
            processing = processing.len(),
            "Queue backlog at startup"
        ),
        (Err(e), _) | (_, Err(e)) => warn!(error = %e, "Failed to inspect queue backlog"),
    }

    let shutdown = CancellationToken::new();
    pool.start().await?;
    let maintenance = tokio::spawn(maintenance::run(
        store.clone(),
        MaintenanceConfig::from_env(),
        shutdown.clone(),
    ));

    shutdown_signal().await;
    shutdown.cancel();

    let stopped = pool.stop().await;
    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance task ended abnormally");
    }

    let stats = pool.stats().await;
    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        retried = stats.retried,
        "Worker exiting"
    );
    log_pool_metrics(&db.pool);

    stopped.context("worker pool did not shut down cleanly")?;
    Ok(())
}
