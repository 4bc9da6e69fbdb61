//! Dispatches a job whose handler always fails, watches it exhaust its
//! retry budget and land in the dead-letter table, then requeues it by
//! hand through the management surface.

use std::sync::Arc;

use chrono::Duration;
use duramq_core::codec::{Callable, CallableRegistry};
use duramq_core::dispatcher::{DispatchOptions, Dispatcher};
use duramq_core::execution::{Executor, ExecutorConfig};
use duramq_core::management::ManagementSurface;
use duramq_core::storage::StoragePort;
use duramq_sqlite::SqliteStoragePort;
use sqlx::sqlite::SqlitePoolOptions;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
    let store = SqliteStoragePort::new(pool);
    store.migrate().await?;
    let storage: Arc<dyn StoragePort> = Arc::new(store);

    let registry = Arc::new(CallableRegistry::new());
    registry.register_function("flaky_webhook", |_params| {
        anyhow::bail!("upstream webhook returned 503")
    });

    let dispatcher = Dispatcher::new(storage.clone(), b"demo-closure-key".to_vec());
    let options = DispatchOptions::builder()
        .max_retries(2)
        .retry_delay(0_i64)
        .build();
    let id = dispatcher
        .dispatch(Callable::Function { name: "flaky_webhook".into() }, serde_json::json!({}), options)
        .await?;

    let executor = Executor::new(storage.clone(), registry, ExecutorConfig::default());
    let shutdown = CancellationToken::new();
    let shutdown_for_executor = shutdown.clone();
    let executor_task = tokio::spawn(async move { executor.run_until_shutdown(shutdown_for_executor).await });

    // Three attempts (initial + 2 retries) are enough to exhaust the
    // budget set above; poll until the job lands in a terminal state.
    for _ in 0..50 {
        if let Some(job) = storage.find(id).await? {
            if job.status == duramq_core::model::JobStatus::Failed {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    let _ = executor_task.await;

    let mgmt = ManagementSurface::new(storage.clone(), Duration::minutes(15));
    let failed = mgmt.list_failed(10).await?;
    println!("dead-lettered jobs: {}", failed.len());
    for row in &failed {
        println!("  failed_job={} job={} exception={}", row.id, row.job_id, row.exception);
    }

    if let Some(row) = failed.first() {
        mgmt.retry_failed(row.id).await?;
        let job = storage.find(row.job_id).await?.expect("job still exists");
        println!("requeued job {} back to {:?}", job.id, job.status);
    }

    Ok(())
}
