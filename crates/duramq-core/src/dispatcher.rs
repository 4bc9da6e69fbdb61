//! The enqueue-side API: turn a callable + params into a durable job row.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::codec::{callable_type_of, decode_callable, encode_callable, Callable, CallableRegistry};
use crate::error::QueueError;
use crate::model::{Job, JobStatus, Priority};
use crate::storage::StoragePort;
use crate::supervisor::{ensure_worker_running, SupervisorConfig};

/// Caller-tunable knobs for a single `dispatch` call.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct DispatchOptions {
    #[builder(default)]
    pub name: Option<String>,
    #[builder(default)]
    pub priority: Priority,
    #[builder(default = 14_400)]
    pub timeout: i64,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 5)]
    pub retry_delay: i64,
    #[builder(default)]
    pub path_files: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Thin wrapper over a `StoragePort` that owns the HMAC key used to sign
/// closures at dispatch time.
pub struct Dispatcher {
    storage: Arc<dyn StoragePort>,
    closure_key: Vec<u8>,
    registry: Option<Arc<CallableRegistry>>,
    supervisor: Option<SupervisorConfig>,
}

impl Dispatcher {
    pub fn new(storage: Arc<dyn StoragePort>, closure_key: Vec<u8>) -> Self {
        Self {
            storage,
            closure_key,
            registry: None,
            supervisor: None,
        }
    }

    /// Attach a `CallableRegistry` so `dispatch_now` can resolve and invoke
    /// callables in-process, bypassing the queue.
    pub fn with_registry(mut self, registry: Arc<CallableRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attach a supervisor config so `dispatch` guarantees a worker for this
    /// queue is running after every enqueue.
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Encode `callable`, build a `Job` row from `options`, and hand it to
    /// storage. If `options.path_files` is set it is checked for existence
    /// up front so a bad preload path fails fast instead of surfacing on
    /// the worker side (spec "Edge case: preload path missing").
    #[instrument(skip(self, callable, params))]
    pub async fn dispatch(
        &self,
        callable: Callable,
        params: serde_json::Value,
        options: DispatchOptions,
    ) -> Result<i64, QueueError> {
        if let Some(path) = &options.path_files {
            if !std::path::Path::new(path).exists() {
                return Err(QueueError::PreloadMissing(path.clone()));
            }
        }

        let callable_type = callable_type_of(&callable);
        let callable_bytes = encode_callable(&callable, &self.closure_key)
            .map_err(|e| QueueError::InvalidCallable(e.to_string()))?;
        let params_bytes =
            serde_json::to_vec(&params).map_err(|e| QueueError::InvalidArgument(e.to_string()))?;

        let builder = Job::builder()
            .name(options.name.unwrap_or_else(|| "job".to_string()))
            .callable_type(callable_type)
            .callable(callable_bytes)
            .params(params_bytes)
            .priority(options.priority)
            .timeout(options.timeout)
            .max_retries(options.max_retries)
            .retry_delay(options.retry_delay);
        let job = match options.path_files {
            Some(path) => builder.path_files(path).build(),
            None => builder.build(),
        };

        let id = self
            .storage
            .enqueue(&job)
            .await
            .map_err(|e| QueueError::DispatchFailed(e.to_string()))?;
        debug!(job_id = id, "dispatched job");

        if let Some(supervisor) = &self.supervisor {
            ensure_worker_running(supervisor)?;
        }

        Ok(id)
    }

    /// Run `callable` against `params` synchronously, under `timeout`,
    /// bypassing the queue entirely: no row is written, nothing is retried.
    /// Requires a registry to be attached via `with_registry`.
    #[instrument(skip(self, callable, params))]
    pub async fn dispatch_now(
        &self,
        callable: Callable,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let registry = self
            .registry
            .clone()
            .ok_or_else(|| QueueError::InvalidArgument("dispatch_now requires a registry".to_string()))?;

        // dispatch_now never touches storage, so it has no job row and no
        // durable uuid; round-tripping through encode/decode still lets it
        // reuse the same HMAC-verified Closure path as a queued job.
        let job_id = Uuid::new_v4();
        let encoded = encode_callable(&callable, &self.closure_key)
            .map_err(|e| QueueError::InvalidCallable(e.to_string()))?;
        let callable = decode_callable(&encoded, &self.closure_key, job_id)?;

        let handle = tokio::spawn(async move {
            tokio::task::spawn_blocking(move || registry.invoke(&callable, params))
                .await
                .map_err(|e| anyhow::anyhow!("handler panicked: {e}"))
                .and_then(|r| r)
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(QueueError::UserError {
                job_id,
                message: e.to_string(),
            }),
            Ok(Err(join_err)) => Err(QueueError::UserError {
                job_id,
                message: format!("task failed: {join_err}"),
            }),
            Err(_) => Err(QueueError::JobTimeout {
                job_id,
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Look up a job's current status by its externally-visible uuid.
    pub async fn get_job_status(&self, uuid: Uuid) -> Result<Option<JobStatus>, QueueError> {
        let job = self
            .storage
            .find_by_uuid(uuid)
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        Ok(job.map(|j| j.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duramq_testing::InMemoryStoragePort;

    #[tokio::test]
    async fn dispatch_persists_a_pending_job() {
        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let dispatcher = Dispatcher::new(storage.clone(), b"test-key".to_vec());

        let id = dispatcher
            .dispatch(
                Callable::Function { name: "ping".into() },
                serde_json::json!({}),
                DispatchOptions::default(),
            )
            .await
            .unwrap();

        let job = storage.find(id).await.unwrap().expect("job exists");
        assert_eq!(job.status, crate::model::JobStatus::Pending);
    }

    #[tokio::test]
    async fn dispatch_rejects_missing_preload_path() {
        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let dispatcher = Dispatcher::new(storage, b"test-key".to_vec());

        let options = DispatchOptions::builder()
            .path_files("/nonexistent/path/for/test".to_string())
            .build();

        let err = dispatcher
            .dispatch(Callable::Function { name: "ping".into() }, serde_json::json!({}), options)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::PreloadMissing(_)));
    }

    #[tokio::test]
    async fn get_job_status_looks_up_by_uuid() {
        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let dispatcher = Dispatcher::new(storage.clone(), b"test-key".to_vec());

        let id = dispatcher
            .dispatch(
                Callable::Function { name: "ping".into() },
                serde_json::json!({}),
                DispatchOptions::default(),
            )
            .await
            .unwrap();
        let uuid = storage.find(id).await.unwrap().unwrap().uuid;

        let status = dispatcher.get_job_status(uuid).await.unwrap();
        assert_eq!(status, Some(crate::model::JobStatus::Pending));
        assert_eq!(dispatcher.get_job_status(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dispatch_now_runs_synchronously_without_enqueuing() {
        use crate::codec::CallableRegistry;

        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let registry = Arc::new(CallableRegistry::new());
        registry.register_function("ping", |_| Ok(()));

        let dispatcher = Dispatcher::new(storage.clone(), b"test-key".to_vec()).with_registry(registry);

        dispatcher
            .dispatch_now(
                Callable::Function { name: "ping".into() },
                serde_json::json!({}),
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn dispatch_now_propagates_a_handler_error() {
        use crate::codec::CallableRegistry;

        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let registry = Arc::new(CallableRegistry::new());
        registry.register_function("always_fails", |_| anyhow::bail!("boom"));

        let dispatcher = Dispatcher::new(storage, b"test-key".to_vec()).with_registry(registry);

        let err = dispatcher
            .dispatch_now(
                Callable::Function { name: "always_fails".into() },
                serde_json::json!({}),
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UserError { .. }));
    }

    #[tokio::test]
    async fn dispatch_invokes_the_supervisor_when_attached() {
        use crate::supervisor::{LockFile, SupervisorConfig};

        let dir = std::env::temp_dir().join(format!("duramq-dispatcher-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let lock = LockFile::new(&dir, "default");
        lock.acquire().unwrap();

        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let dispatcher = Dispatcher::new(storage, b"test-key".to_vec()).with_supervisor(SupervisorConfig {
            run_dir: dir.clone(),
            queue_name: "default".to_string(),
            worker_binary: std::path::PathBuf::from("/nonexistent/duramq-worker"),
            driver_config_json: "{}".to_string(),
            worker_config_json: "{}".to_string(),
        });

        // The lock is already held, so dispatch must not attempt to spawn
        // the (nonexistent) worker binary and must succeed.
        dispatcher
            .dispatch(
                Callable::Function { name: "ping".into() },
                serde_json::json!({}),
                DispatchOptions::default(),
            )
            .await
            .unwrap();

        drop(lock);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dispatch_now_without_a_registry_is_rejected() {
        let storage: Arc<dyn StoragePort> = Arc::new(InMemoryStoragePort::new());
        let dispatcher = Dispatcher::new(storage, b"test-key".to_vec());

        let err = dispatcher
            .dispatch_now(
                Callable::Function { name: "ping".into() },
                serde_json::json!({}),
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }
}
