//! Worker supervisor: lock-file liveness checks and detached spawn.
//!
//! The lock file holds the PID of the worker currently allowed to run
//! against a given queue name. Liveness is checked with a signal-0 kill
//! (`kill(pid, 0)`), which returns success if the process exists and is
//! owned by us, without actually signaling it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use tracing::{info, warn};

use crate::error::QueueError;

/// Whether a PID currently names a live process.
#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
    // No portable liveness probe outside Unix; assume stale so a new
    // supervisor can take over rather than deadlock forever.
    false
}

/// A worker's PID lock file, scoped to one queue name.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(run_dir: impl AsRef<Path>, queue_name: &str) -> Self {
        Self {
            path: run_dir.as_ref().join(format!("duramq-{queue_name}.pid")),
        }
    }

    /// Acquire the lock for the current process, or fail with
    /// `LockContention` if a live worker already holds it.
    pub fn acquire(&self) -> Result<(), QueueError> {
        if let Ok(existing) = fs::read_to_string(&self.path) {
            if let Ok(pid) = existing.trim().parse::<i32>() {
                if process_is_alive(pid) {
                    return Err(QueueError::LockContention(format!(
                        "worker pid {pid} already holds {}",
                        self.path.display()
                    )));
                }
                warn!(stale_pid = pid, path = %self.path.display(), "clearing stale lock file");
            }
        }

        fs::write(&self.path, std::process::id().to_string())
            .with_context(|| format!("writing lock file {}", self.path.display()))
            .map_err(|e| QueueError::LockContention(e.to_string()))?;
        info!(path = %self.path.display(), pid = std::process::id(), "lock acquired");
        Ok(())
    }

    /// Release the lock. Safe to call even if another worker has already
    /// overwritten the file — we only remove it if it still names us.
    pub fn release(&self) {
        if let Ok(existing) = fs::read_to_string(&self.path) {
            if existing.trim() == std::process::id().to_string() {
                let _ = fs::remove_file(&self.path);
            }
        }
    }

    /// Whether the lock file currently names a PID that is still alive.
    /// Read-only: unlike `acquire`, never writes or clears the file.
    pub fn is_held_by_live_process(&self) -> bool {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .is_some_and(process_is_alive)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// What a dispatcher needs to know to spawn and probe a worker process for
/// one queue, so `dispatch()` can guarantee *something* is consuming the
/// queue it just enqueued into.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory the worker's PID lock file lives in.
    pub run_dir: PathBuf,
    pub queue_name: String,
    /// Path to the `duramq-worker` binary to spawn.
    pub worker_binary: PathBuf,
    /// JSON-encoded `DriverConfig`, passed as `--driver-config`.
    pub driver_config_json: String,
    /// JSON-encoded `WorkerConfig`, passed as `--config`.
    pub worker_config_json: String,
}

/// Spawn a detached worker for `config.queue_name` unless one is already
/// running, per the lock file. Never blocks on the child; the worker reports
/// its own readiness by claiming jobs once started.
pub fn ensure_worker_running(config: &SupervisorConfig) -> Result<(), QueueError> {
    let lock = LockFile::new(&config.run_dir, &config.queue_name);
    if lock.is_held_by_live_process() {
        return Ok(());
    }

    let child = Command::new(&config.worker_binary)
        .arg("run")
        .arg(format!("--driver-config={}", config.driver_config_json))
        .arg(format!("--config={}", config.worker_config_json))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| QueueError::LockContention(format!("failed to spawn worker: {e}")))?;

    info!(pid = child.id(), queue = %config.queue_name, "spawned detached worker");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_current_pid() {
        let dir = std::env::temp_dir().join(format!("duramq-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let lock = LockFile::new(&dir, "default");
        lock.acquire().unwrap();

        let contents = fs::read_to_string(dir.join("duramq-default.pid")).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(lock);
        assert!(!dir.join("duramq-default.pid").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn acquire_clears_a_stale_lock_from_a_dead_pid() {
        let dir = std::env::temp_dir().join(format!("duramq-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        // pid 1 belongs to init and is never us; a very large unused pid is
        // a safer stand-in for "definitely dead" in a sandboxed test run.
        fs::write(dir.join("duramq-default.pid"), "999999").unwrap();

        let lock = LockFile::new(&dir, "default");
        assert!(lock.acquire().is_ok());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn is_held_by_live_process_reflects_a_held_lock() {
        let dir = std::env::temp_dir().join(format!("duramq-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let lock = LockFile::new(&dir, "default");
        assert!(!lock.is_held_by_live_process());

        lock.acquire().unwrap();
        assert!(lock.is_held_by_live_process());

        drop(lock);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn is_held_by_live_process_is_false_for_a_stale_pid() {
        let dir = std::env::temp_dir().join(format!("duramq-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("duramq-default.pid"), "999999").unwrap();

        let lock = LockFile::new(&dir, "default");
        assert!(!lock.is_held_by_live_process());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn ensure_worker_running_skips_spawn_when_lock_is_live() {
        let dir = std::env::temp_dir().join(format!("duramq-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let lock = LockFile::new(&dir, "default");
        lock.acquire().unwrap();

        let config = SupervisorConfig {
            run_dir: dir.clone(),
            queue_name: "default".to_string(),
            worker_binary: PathBuf::from("/nonexistent/duramq-worker"),
            driver_config_json: "{}".to_string(),
            worker_config_json: "{}".to_string(),
        };
        // Would fail to spawn a nonexistent binary if it tried; succeeding
        // here proves the live lock short-circuited the spawn entirely.
        assert!(ensure_worker_running(&config).is_ok());

        drop(lock);
        let _ = fs::remove_dir_all(&dir);
    }
}
