//! Worker binary: runs the claim/execute loop, or drives the management
//! surface (stats, retry, reaping) as a one-shot command.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duramq_core::codec::CallableRegistry;
use duramq_core::config::{DriverConfig, WorkerConfig};
use duramq_core::execution::{Executor, ExecutorConfig};
use duramq_core::management::ManagementSurface;
use duramq_core::storage::{DriverKind, StoragePort};
use duramq_core::supervisor::LockFile;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "duramq-worker", about = "Durable job queue worker")]
struct Cli {
    /// JSON-encoded `DriverConfig`, overriding the environment. Set by the
    /// Worker Supervisor when it spawns a worker on a caller's behalf.
    #[arg(long)]
    driver_config: Option<String>,
    /// JSON-encoded `WorkerConfig`, overriding the environment. Set by the
    /// Worker Supervisor when it spawns a worker on a caller's behalf.
    #[arg(long)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the claim/execute loop until SIGINT/SIGTERM or the worker's
    /// self-timeout elapses.
    Run,
    /// Print aggregate queue counts.
    Stats,
    /// List the dead-letter audit table.
    ListFailed {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Re-enqueue a dead-lettered job by its failed_jobs id.
    RetryFailed { failed_job_id: i64 },
    /// Re-enqueue every failed job that still has retry budget.
    RetryAllFailed,
    /// Delete failed-job audit rows older than `days_old` days.
    ClearFailedJobs { days_old: i64 },
    /// Return jobs stuck `processing` past the configured stale window.
    ReapStale,
}

async fn build_storage(driver: &DriverConfig) -> Result<Arc<dyn StoragePort>> {
    match driver.kind {
        DriverKind::Postgres => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(driver.max_connections)
                .connect(&driver.connection_string)
                .await
                .context("connecting to postgres")?;
            let store = duramq_postgres::PgStoragePort::new(pool);
            store.migrate().await.context("running postgres migrations")?;
            Ok(Arc::new(store))
        }
        DriverKind::Sqlite => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(driver.max_connections)
                .connect(&driver.connection_string)
                .await
                .context("connecting to sqlite")?;
            let store = duramq_sqlite::SqliteStoragePort::new(pool);
            store.migrate().await.context("running sqlite migrations")?;
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("{} has no driver crate in this workspace yet", other.as_str()),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Sleeps for `worker_timeout`, or forever when unset, so this can race
/// against `wait_for_shutdown_signal` in a single `select!` without an `if`
/// branch on each arm.
async fn sleep_until_worker_timeout(worker_timeout: Option<std::time::Duration>) {
    match worker_timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let (env_worker_config, env_driver_config) =
        duramq_core::config::load().context("loading configuration")?;
    let worker_config = match &cli.config {
        Some(json) => serde_json::from_str(json).context("parsing --config override")?,
        None => env_worker_config,
    };
    let driver_config = match &cli.driver_config {
        Some(json) => serde_json::from_str(json).context("parsing --driver-config override")?,
        None => env_driver_config,
    };
    let storage = build_storage(&driver_config).await?;

    match cli.command {
        Command::Run => run(worker_config, storage).await,
        Command::Stats => {
            let mgmt = ManagementSurface::new(storage, chrono::Duration::from_std(worker_config.stale_after)?);
            let stats = mgmt.stats().await?;
            println!("{stats:#?}");
            Ok(())
        }
        Command::ListFailed { limit } => {
            let mgmt = ManagementSurface::new(storage, chrono::Duration::from_std(worker_config.stale_after)?);
            for failed in mgmt.list_failed(limit).await? {
                println!("{} job={} at={}: {}", failed.id, failed.job_id, failed.failed_at, failed.exception);
            }
            Ok(())
        }
        Command::RetryFailed { failed_job_id } => {
            let mgmt = ManagementSurface::new(storage, chrono::Duration::from_std(worker_config.stale_after)?);
            mgmt.retry_failed(failed_job_id).await?;
            println!("requeued failed job {failed_job_id}");
            Ok(())
        }
        Command::RetryAllFailed => {
            let mgmt = ManagementSurface::new(storage, chrono::Duration::from_std(worker_config.stale_after)?);
            let count = mgmt.retry_all_failed().await?;
            println!("requeued {count} failed job(s)");
            Ok(())
        }
        Command::ClearFailedJobs { days_old } => {
            let mgmt = ManagementSurface::new(storage, chrono::Duration::from_std(worker_config.stale_after)?);
            let count = mgmt.clear_failed_jobs(days_old).await?;
            println!("cleared {count} failed-job audit row(s)");
            Ok(())
        }
        Command::ReapStale => {
            let mgmt = ManagementSurface::new(storage, chrono::Duration::from_std(worker_config.stale_after)?);
            let count = mgmt.reap_stale().await?;
            println!("reclaimed {count} stale job(s)");
            Ok(())
        }
    }
}

async fn run(worker_config: WorkerConfig, storage: Arc<dyn StoragePort>) -> Result<()> {
    let lock = LockFile::new(&worker_config.run_dir, &worker_config.queue_name);
    lock.acquire()?;

    let registry = Arc::new(CallableRegistry::new());
    let executor_config = ExecutorConfig {
        worker_pid: std::process::id().to_string(),
        batch_size: worker_config.batch_size,
        poll_interval: worker_config.poll_interval,
        closure_key: worker_config.closure_key.clone(),
    };
    let executor = Executor::new(storage.clone(), registry, executor_config);

    let shutdown = CancellationToken::new();
    let reaper_storage = storage.clone();
    let stale_after = chrono::Duration::from_std(worker_config.stale_after)?;
    let reaper_shutdown = shutdown.clone();
    let reaper = tokio::spawn(async move {
        let mgmt = ManagementSurface::new(reaper_storage, stale_after);
        loop {
            tokio::select! {
                _ = reaper_shutdown.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {
                    if let Err(e) = mgmt.reap_stale().await {
                        tracing::error!(error = %e, "reap_stale failed");
                    }
                }
            }
        }
    });

    let executor_shutdown = shutdown.clone();
    let executor_task = tokio::spawn(async move { executor.run_until_shutdown(executor_shutdown).await });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, draining in-flight jobs");
        }
        _ = sleep_until_worker_timeout(worker_config.worker_timeout) => {
            tracing::info!("worker self-timeout elapsed, draining in-flight jobs");
        }
    }
    shutdown.cancel();

    if tokio::time::timeout(std::time::Duration::from_secs(30), executor_task)
        .await
        .is_err()
    {
        tracing::warn!("executor did not drain within 30s, exiting anyway");
    }

    let _ = reaper.await;
    lock.release();
    Ok(())
}
