//! The executor loop: claim, run, report back.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec::{decode_callable, CallableRegistry};
use crate::model::Job;
use crate::retry::should_retry;
use crate::storage::StoragePort;

/// Tunable knobs for one executor loop instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_pid: String,
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub closure_key: Vec<u8>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_pid: std::process::id().to_string(),
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            closure_key: Vec::new(),
        }
    }
}

/// Drives claim-execute-report cycles until `shutdown` is triggered.
pub struct Executor {
    storage: Arc<dyn StoragePort>,
    registry: Arc<CallableRegistry>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(storage: Arc<dyn StoragePort>, registry: Arc<CallableRegistry>, config: ExecutorConfig) -> Self {
        Self {
            storage,
            registry,
            config,
        }
    }

    /// Poll for ready jobs and run each to completion, until `shutdown` is
    /// cancelled. Each claimed batch runs sequentially; concurrency across
    /// jobs is achieved by running multiple `Executor`s, not within one.
    pub async fn run_until_shutdown(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                info!("executor shutting down");
                return;
            }

            let claimed = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.storage.claim_ready(&self.config.worker_pid, self.config.batch_size) => result,
            };

            let jobs = match claimed {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "claim_ready failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for job in jobs {
                self.execute_one(job).await;
            }
        }
    }

    /// Decode, dispatch to the registry under a hard timeout, and report
    /// the outcome back to storage. A panic inside the handler is caught
    /// via the `JoinHandle`'s `Err` and treated like any other failure.
    async fn execute_one(&self, job: Job) {
        let job_id = job.id;
        let timeout = Duration::from_secs(job.timeout.max(0) as u64);
        let uuid = job.uuid;

        let callable = match decode_callable(&job.callable, &self.config.closure_key, uuid) {
            Ok(c) => c,
            Err(e) => {
                self.report_failure(&job, &e.to_string(), e.is_always_terminal()).await;
                return;
            }
        };

        let params: serde_json::Value = match serde_json::from_slice(&job.params) {
            Ok(v) => v,
            Err(e) => {
                self.report_failure(&job, &format!("bad params: {e}"), false).await;
                return;
            }
        };

        let registry = self.registry.clone();
        let handle = tokio::spawn(async move {
            tokio::task::spawn_blocking(move || registry.invoke(&callable, params))
                .await
                .map_err(|e| anyhow::anyhow!("handler panicked: {e}"))
                .and_then(|r| r)
        });

        let outcome = tokio::time::timeout(timeout, handle).await;

        match outcome {
            Ok(Ok(Ok(()))) => {
                if let Err(e) = self.storage.mark_completed(job_id).await {
                    error!(job_id, error = %e, "failed to record completion");
                }
            }
            Ok(Ok(Err(e))) => {
                self.report_failure(&job, &e.to_string(), false).await;
            }
            Ok(Err(join_err)) => {
                self.report_failure(&job, &format!("task failed: {join_err}"), false).await;
            }
            Err(_) => {
                warn!(job_id, timeout_secs = job.timeout, "job timed out");
                self.report_failure(&job, &format!("timed out after {}s", job.timeout), false)
                    .await;
            }
        }
    }

    async fn report_failure(&self, job: &Job, message: &str, always_terminal: bool) {
        let payload = String::from_utf8_lossy(&job.params).into_owned();
        let result = if should_retry(job, always_terminal) {
            self.storage.mark_failed(job.id, message, &payload).await
        } else {
            self.storage.dead_letter(job.id, message, &payload).await
        };
        if let Err(e) = result {
            error!(job_id = job.id, error = %e, "failed to record job failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Callable;
    use crate::dispatcher::{DispatchOptions, Dispatcher};
    use duramq_testing::InMemoryStoragePort;

    #[tokio::test]
    async fn a_successful_job_is_marked_completed() {
        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let registry = Arc::new(CallableRegistry::new());
        registry.register_function("noop", |_| Ok(()));

        let dispatcher = Dispatcher::new(storage.clone(), Vec::new());
        let id = dispatcher
            .dispatch(
                Callable::Function { name: "noop".into() },
                serde_json::json!({}),
                DispatchOptions::default(),
            )
            .await
            .unwrap();

        let executor = Executor::new(storage.clone(), registry, ExecutorConfig::default());
        let shutdown = CancellationToken::new();
        let claimed = storage.claim_ready("test-pid", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        executor.execute_one(claimed.into_iter().next().unwrap()).await;
        drop(shutdown);

        let job = storage.find(id).await.unwrap().unwrap();
        assert_eq!(job.status, crate::model::JobStatus::Completed);
    }

    #[tokio::test]
    async fn a_failing_job_retains_retry_budget_and_goes_back_to_pending() {
        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let registry = Arc::new(CallableRegistry::new());
        registry.register_function("always_fails", |_| anyhow::bail!("boom"));

        let dispatcher = Dispatcher::new(storage.clone(), Vec::new());
        let id = dispatcher
            .dispatch(
                Callable::Function { name: "always_fails".into() },
                serde_json::json!({}),
                DispatchOptions::default(),
            )
            .await
            .unwrap();

        let executor = Executor::new(storage.clone(), registry, ExecutorConfig::default());
        let claimed = storage.claim_ready("test-pid", 10).await.unwrap();
        executor.execute_one(claimed.into_iter().next().unwrap()).await;

        let job = storage.find(id).await.unwrap().unwrap();
        assert_eq!(job.status, crate::model::JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
    }
}
