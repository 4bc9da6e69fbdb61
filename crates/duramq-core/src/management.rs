//! Operator-facing surface: stats, manual retry, reaping stale leases.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;

use crate::model::FailedJob;
use crate::storage::{QueueStats, StoragePort};

/// How long a `processing` job can go without completing before it is
/// considered abandoned by a dead worker and reclaimed.
pub struct ManagementSurface {
    storage: Arc<dyn StoragePort>,
    stale_after: Duration,
}

impl ManagementSurface {
    pub fn new(storage: Arc<dyn StoragePort>, stale_after: Duration) -> Self {
        Self { storage, stale_after }
    }

    /// Spec "Operation: stats" — aggregate counts across every status.
    pub async fn stats(&self) -> anyhow::Result<QueueStats> {
        self.storage.stats().await
    }

    /// Spec "Operation: retry_failed" — re-enqueue one dead-lettered job.
    pub async fn retry_failed(&self, failed_job_id: i64) -> anyhow::Result<()> {
        self.storage.retry_failed(failed_job_id).await?;
        info!(failed_job_id, "requeued dead-lettered job");
        Ok(())
    }

    /// List the dead-letter audit table, most recent first.
    pub async fn list_failed(&self, limit: i64) -> anyhow::Result<Vec<FailedJob>> {
        self.storage.list_failed(limit).await
    }

    /// Spec "Operation: retry_all_failed" — re-enqueue every dead-lettered
    /// job that still has retry budget, oldest first. Returns the count
    /// requeued.
    pub async fn retry_all_failed(&self) -> anyhow::Result<u64> {
        let count = self.storage.retry_all_failed().await?;
        if count > 0 {
            info!(count, "requeued failed jobs with remaining retry budget");
        }
        Ok(count)
    }

    /// Spec "Operation: clear_failed_jobs" — delete dead-letter audit rows
    /// older than `days_old` days. Returns the count removed.
    pub async fn clear_failed_jobs(&self, days_old: i64) -> anyhow::Result<u64> {
        let count = self.storage.clear_failed_jobs(days_old).await?;
        if count > 0 {
            info!(count, days_old, "cleared old failed-job audit rows");
        }
        Ok(count)
    }

    /// Spec "Operation: reap_stale" — return jobs stuck `processing` past
    /// `stale_after` to `pending`, because the worker that claimed them
    /// died without heartbeating back. Returns the count reclaimed.
    pub async fn reap_stale(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - self.stale_after;
        let reclaimed = self.storage.reclaim_stale(cutoff).await?;
        if reclaimed > 0 {
            info!(count = reclaimed, "reclaimed stale jobs");
        }
        Ok(reclaimed)
    }

    /// Purge `completed` jobs older than `older_than` to keep the table
    /// from growing unbounded.
    pub async fn purge_completed(&self, older_than: chrono::DateTime<Utc>) -> anyhow::Result<u64> {
        self.storage.purge_completed(older_than).await
    }
}
