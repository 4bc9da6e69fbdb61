//! Environment-driven configuration for the worker binary and drivers.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::storage::DriverKind;

/// Which database a worker connects to and how it gets there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub kind: DriverKind,
    pub connection_string: String,
    pub max_connections: u32,
}

impl DriverConfig {
    /// Read `DURAMQ_DRIVER`, `DURAMQ_DATABASE_URL`, and
    /// `DURAMQ_MAX_CONNECTIONS` from the process environment. Call
    /// `dotenvy::dotenv()` before this if a `.env` file should be honored.
    pub fn from_env() -> anyhow::Result<Self> {
        let kind_str =
            std::env::var("DURAMQ_DRIVER").context("DURAMQ_DRIVER must be set (postgres, sqlite)")?;
        let kind = DriverKind::parse(&kind_str)
            .with_context(|| format!("unrecognized DURAMQ_DRIVER: {kind_str}"))?;
        let connection_string =
            std::env::var("DURAMQ_DATABASE_URL").context("DURAMQ_DATABASE_URL must be set")?;
        let max_connections = std::env::var("DURAMQ_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DURAMQ_MAX_CONNECTIONS must be an integer")?
            .unwrap_or(5);

        Ok(Self {
            kind,
            connection_string,
            max_connections,
        })
    }
}

/// Tunables for the worker process itself, independent of its storage driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub run_dir: std::path::PathBuf,
    pub closure_key: Vec<u8>,
    /// Bounds the worker process's total lifetime; once elapsed the worker
    /// drains in-flight jobs and exits cleanly, the same as on a shutdown
    /// signal. `None` means run until signaled.
    pub worker_timeout: Option<Duration>,
}

impl WorkerConfig {
    /// Read `DURAMQ_QUEUE_NAME`, `DURAMQ_BATCH_SIZE`, `DURAMQ_POLL_INTERVAL_MS`,
    /// `DURAMQ_STALE_AFTER_SECS`, `DURAMQ_RUN_DIR`, `DURAMQ_CLOSURE_KEY`, and
    /// `DURAMQ_WORKER_TIMEOUT_SECS`. If `DURAMQ_CLOSURE_KEY` is unset a random
    /// key is generated for this process, so a freshly booted worker never
    /// accidentally accepts a closure payload signed by a different process.
    pub fn from_env() -> anyhow::Result<Self> {
        let closure_key = match std::env::var("DURAMQ_CLOSURE_KEY") {
            Ok(key) => key.into_bytes(),
            Err(_) => random_closure_key(),
        };

        let queue_name = std::env::var("DURAMQ_QUEUE_NAME").unwrap_or_else(|_| "default".to_string());
        let batch_size = std::env::var("DURAMQ_BATCH_SIZE")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DURAMQ_BATCH_SIZE must be an integer")?
            .unwrap_or(10);
        let poll_interval_ms = std::env::var("DURAMQ_POLL_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DURAMQ_POLL_INTERVAL_MS must be an integer")?
            .unwrap_or(500u64);
        let stale_after_secs = std::env::var("DURAMQ_STALE_AFTER_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DURAMQ_STALE_AFTER_SECS must be an integer")?
            .unwrap_or(900u64);
        let run_dir = std::env::var("DURAMQ_RUN_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let worker_timeout = std::env::var("DURAMQ_WORKER_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DURAMQ_WORKER_TIMEOUT_SECS must be an integer")?
            .map(Duration::from_secs);

        Ok(Self {
            queue_name,
            batch_size,
            poll_interval: Duration::from_millis(poll_interval_ms),
            stale_after: Duration::from_secs(stale_after_secs),
            run_dir,
            closure_key,
            worker_timeout,
        })
    }
}

fn random_closure_key() -> Vec<u8> {
    (0..32).map(|_| fastrand::u8(..)).collect()
}

/// Load a `.env` file if present, then read both configs from the
/// environment. Mirrors the load-then-parse shape used across the
/// application binaries this crate is modeled on.
pub fn load() -> anyhow::Result<(WorkerConfig, DriverConfig)> {
    let _ = dotenvy::dotenv();
    Ok((WorkerConfig::from_env()?, DriverConfig::from_env()?))
}
