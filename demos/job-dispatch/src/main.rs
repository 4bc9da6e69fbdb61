//! Dispatches a handful of jobs at different priorities against an
//! in-process SQLite database and runs them to completion.

use std::sync::Arc;

use duramq_core::codec::{Callable, CallableRegistry};
use duramq_core::dispatcher::{DispatchOptions, Dispatcher};
use duramq_core::execution::{Executor, ExecutorConfig};
use duramq_core::model::Priority;
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
    registry.register_function("send_welcome_email", |params| {
        println!("sending welcome email to {params}");
        Ok(())
    });
    registry.register_function("generate_report", |params| {
        println!("generating report for {params}");
        Ok(())
    });

    let dispatcher = Dispatcher::new(storage.clone(), b"demo-closure-key".to_vec());

    dispatcher
        .dispatch(
            Callable::Function { name: "generate_report".into() },
            serde_json::json!({"report": "monthly-usage"}),
            DispatchOptions::builder().priority(Priority::Low).build(),
        )
        .await?;

    dispatcher
        .dispatch(
            Callable::Function { name: "send_welcome_email".into() },
            serde_json::json!({"user_id": 42}),
            DispatchOptions::builder().priority(Priority::Urgent).build(),
        )
        .await?;

    // The urgent email job claims ahead of the low-priority report job
    // even though the report was dispatched first.
    let executor = Executor::new(storage.clone(), registry, ExecutorConfig::default());
    let shutdown = CancellationToken::new();
    let shutdown_for_executor = shutdown.clone();
    let executor_task = tokio::spawn(async move { executor.run_until_shutdown(shutdown_for_executor).await });

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    shutdown.cancel();
    let _ = executor_task.await;

    let stats = storage.stats().await?;
    println!("final stats: {stats:?}");
    Ok(())
}
