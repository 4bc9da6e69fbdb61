//! The `StoragePort` trait: the single seam every driver crate implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{FailedJob, Job, JobStatus};

/// Which SQL dialect a `StoragePort` implementation speaks.
///
/// Only `Postgres` and `Sqlite` have a concrete driver in this workspace;
/// the remaining variants exist so callers can name a target driver in
/// configuration ahead of one being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverKind {
    Postgres,
    Sqlite,
    MySql,
    MsSql,
    Oracle,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Postgres => "postgres",
            DriverKind::Sqlite => "sqlite",
            DriverKind::MySql => "mysql",
            DriverKind::MsSql => "mssql",
            DriverKind::Oracle => "oracle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "postgres" | "postgresql" => Some(DriverKind::Postgres),
            "sqlite" => Some(DriverKind::Sqlite),
            "mysql" => Some(DriverKind::MySql),
            "mssql" | "sqlserver" => Some(DriverKind::MsSql),
            "oracle" => Some(DriverKind::Oracle),
            _ => None,
        }
    }
}

/// Aggregate counts for the management surface.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_lettered: i64,
    /// Mean seconds between `created_at` and `completed_at` across
    /// `completed` jobs. `None` when no job has completed yet.
    pub avg_completion_secs: Option<f64>,
}

/// The storage seam a dispatcher, executor, and management surface all
/// depend on. Every method that mutates dispatch-visible state must do so
/// atomically with respect to concurrent workers — see each driver's own
/// module docs for how it gets there (`FOR UPDATE SKIP LOCKED` on Postgres,
/// `BEGIN IMMEDIATE` on SQLite).
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Insert a new job row in `pending` status. Returns the assigned id.
    async fn enqueue(&self, job: &Job) -> anyhow::Result<i64>;

    /// Atomically claim up to `limit` ready jobs, ordered by priority rank
    /// then `created_at`, and mark them `processing` with the given `pid`
    /// tag. A job is ready when `status = pending`. Returns the claimed rows.
    async fn claim_ready(&self, pid: &str, limit: i64) -> anyhow::Result<Vec<Job>>;

    /// Mark a job `completed`.
    async fn mark_completed(&self, job_id: i64) -> anyhow::Result<()>;

    /// Mark a job `failed`. If the job still has retry budget the driver
    /// resets it to `pending` for a later claim instead; callers should not
    /// assume the row ends in `failed` status just because this was called.
    async fn mark_failed(&self, job_id: i64, exception: &str, payload: &str) -> anyhow::Result<()>;

    /// Force a job straight to `failed` and write the audit row, bypassing
    /// retry budget. Used for the `TamperedClosure` carve-out.
    async fn dead_letter(&self, job_id: i64, exception: &str, payload: &str) -> anyhow::Result<()>;

    /// Fetch a single job by id.
    async fn find(&self, job_id: i64) -> anyhow::Result<Option<Job>>;

    /// Fetch a single job by its externally-visible `uuid`, the handle a
    /// dispatcher hands back to its caller.
    async fn find_by_uuid(&self, uuid: Uuid) -> anyhow::Result<Option<Job>>;

    /// Reclaim jobs stuck `processing` past `lease.timeout` seconds, since
    /// the worker that claimed them died without reporting back, and
    /// return them to `pending`. Returns the number reclaimed.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Aggregate counts across all statuses.
    async fn stats(&self) -> anyhow::Result<QueueStats>;

    /// List rows from the dead-letter audit table, most recent first.
    async fn list_failed(&self, limit: i64) -> anyhow::Result<Vec<FailedJob>>;

    /// Re-enqueue a dead-lettered job: clears `retry_count`, sets status
    /// back to `pending`.
    async fn retry_failed(&self, failed_job_id: i64) -> anyhow::Result<()>;

    /// Re-enqueue every job in `failed` status that still has retry budget
    /// (`retry_count < max_retries`), oldest `created_at` first. Unlike
    /// `retry_failed`, this increments `retry_count` rather than clearing
    /// it, since the job is resuming its existing retry sequence instead
    /// of being manually restarted. Returns the number requeued.
    async fn retry_all_failed(&self) -> anyhow::Result<u64>;

    /// Delete `failed_jobs` audit rows with `failed_at` older than
    /// `days_old` days. Returns the number removed.
    async fn clear_failed_jobs(&self, days_old: i64) -> anyhow::Result<u64>;

    /// Purge completed jobs older than `older_than`. Returns rows removed.
    async fn purge_completed(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Whether a status transition is one the state machine allows.
///
/// `pending -> processing -> {completed, pending (retry), failed}`. Any
/// other edge (e.g. `completed -> processing`) is a bug in the caller.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, Completed)
            | (Processing, Pending)
            | (Processing, Failed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_kind_round_trips() {
        for kind in [
            DriverKind::Postgres,
            DriverKind::Sqlite,
            DriverKind::MySql,
            DriverKind::MsSql,
            DriverKind::Oracle,
        ] {
            assert_eq!(DriverKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn transition_table_matches_state_machine() {
        assert!(is_valid_transition(JobStatus::Pending, JobStatus::Processing));
        assert!(is_valid_transition(JobStatus::Processing, JobStatus::Completed));
        assert!(is_valid_transition(JobStatus::Processing, JobStatus::Pending));
        assert!(is_valid_transition(JobStatus::Processing, JobStatus::Failed));
        assert!(!is_valid_transition(JobStatus::Completed, JobStatus::Processing));
        assert!(!is_valid_transition(JobStatus::Pending, JobStatus::Completed));
        assert!(!is_valid_transition(JobStatus::Failed, JobStatus::Processing));
    }
}
