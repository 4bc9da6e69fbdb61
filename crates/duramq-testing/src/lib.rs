//! An in-memory `StoragePort` for unit tests that need a real queue without
//! a database. Mirrors the state transitions a SQL driver performs, minus
//! durability and minus any row-locking subtlety around concurrent claims.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use duramq_core::model::{FailedJob, Job, JobStatus};
use duramq_core::retry::backoff_seconds;
use duramq_core::storage::{QueueStats, StoragePort};
use uuid::Uuid;

/// In-memory stand-in for a SQL-backed `StoragePort`.
///
/// Claims are serialized behind a single write lock, so this is not a
/// realistic stress test of concurrent-claim correctness — it exists to
/// let dispatcher/executor/management logic be tested without spinning up
/// Postgres or SQLite.
pub struct InMemoryStoragePort {
    jobs: RwLock<HashMap<i64, Job>>,
    failed: RwLock<Vec<FailedJob>>,
    next_job_id: AtomicI64,
    next_failed_id: AtomicI64,
}

impl InMemoryStoragePort {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            failed: RwLock::new(Vec::new()),
            next_job_id: AtomicI64::new(1),
            next_failed_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryStoragePort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoragePort for InMemoryStoragePort {
    async fn enqueue(&self, job: &Job) -> anyhow::Result<i64> {
        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let mut row = job.clone();
        row.id = id;
        self.jobs.write().unwrap_or_else(|e| e.into_inner()).insert(id, row);
        Ok(id)
    }

    async fn claim_ready(&self, pid: &str, limit: i64) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut ready: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut claimed = Vec::new();
        for job in ready.into_iter().take(limit.max(0) as usize) {
            job.status = JobStatus::Processing;
            job.pid = Some(pid.to_string());
            job.started_at = Some(Utc::now());
            job.updated_at = Utc::now();
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, job_id: i64) -> anyhow::Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: i64, exception: &str, payload: &str) -> anyhow::Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(());
        };

        if job.has_retry_budget() {
            job.retry_count += 1;
            job.status = JobStatus::Pending;
            job.pid = None;
            job.updated_at = Utc::now() + chrono::Duration::seconds(backoff_seconds(job));
            Ok(())
        } else {
            job.status = JobStatus::Failed;
            job.updated_at = Utc::now();
            drop(jobs);
            self.write_failed_row(job_id, exception, payload);
            Ok(())
        }
    }

    async fn dead_letter(&self, job_id: i64, exception: &str, payload: &str) -> anyhow::Result<()> {
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            if let Some(job) = jobs.get_mut(&job_id) {
                job.status = JobStatus::Failed;
                job.updated_at = Utc::now();
            }
        }
        self.write_failed_row(job_id, exception, payload);
        Ok(())
    }

    async fn find(&self, job_id: i64) -> anyhow::Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned())
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|j| j.uuid == uuid)
            .cloned())
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing && job.started_at.map(|s| s < older_than).unwrap_or(false) {
                job.status = JobStatus::Pending;
                job.pid = None;
                job.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn stats(&self) -> anyhow::Result<QueueStats> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = QueueStats::default();
        let mut completion_secs = Vec::new();
        for job in jobs.values() {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if let Some(completed_at) = job.completed_at {
                        completion_secs
                            .push((completed_at - job.created_at).num_milliseconds() as f64 / 1000.0);
                    }
                }
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats.dead_lettered = self.failed.read().unwrap_or_else(|e| e.into_inner()).len() as i64;
        if !completion_secs.is_empty() {
            stats.avg_completion_secs = Some(completion_secs.iter().sum::<f64>() / completion_secs.len() as f64);
        }
        Ok(stats)
    }

    async fn list_failed(&self, limit: i64) -> anyhow::Result<Vec<FailedJob>> {
        let failed = self.failed.read().unwrap_or_else(|e| e.into_inner());
        Ok(failed.iter().rev().take(limit.max(0) as usize).cloned().collect())
    }

    async fn retry_failed(&self, failed_job_id: i64) -> anyhow::Result<()> {
        let job_id = {
            let failed = self.failed.read().unwrap_or_else(|e| e.into_inner());
            failed
                .iter()
                .find(|f| f.id == failed_job_id)
                .map(|f| f.job_id)
        };
        let Some(job_id) = job_id else {
            anyhow::bail!("no failed job with id {failed_job_id}");
        };

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::Pending;
            job.retry_count = 0;
            job.pid = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn retry_all_failed(&self) -> anyhow::Result<u64> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut eligible: Vec<(i64, DateTime<Utc>)> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed && j.retry_count < j.max_retries)
            .map(|j| (j.id, j.created_at))
            .collect();
        eligible.sort_by_key(|(_, created_at)| *created_at);

        for (id, _) in &eligible {
            if let Some(job) = jobs.get_mut(id) {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.pid = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(eligible.len() as u64)
    }

    async fn clear_failed_jobs(&self, days_old: i64) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - Duration::days(days_old);
        let mut failed = self.failed.write().unwrap_or_else(|e| e.into_inner());
        let before = failed.len();
        failed.retain(|f| f.failed_at >= cutoff);
        Ok((before - failed.len()) as u64)
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.status == JobStatus::Completed && j.completed_at.map(|c| c < older_than).unwrap_or(false))
        });
        Ok((before - jobs.len()) as u64)
    }
}

impl InMemoryStoragePort {
    fn write_failed_row(&self, job_id: i64, exception: &str, payload: &str) {
        let id = self.next_failed_id.fetch_add(1, Ordering::SeqCst);
        let mut failed = self.failed.write().unwrap_or_else(|e| e.into_inner());
        failed.push(FailedJob {
            id,
            uuid: Uuid::new_v4(),
            job_id,
            exception: exception.to_string(),
            payload: payload.to_string(),
            failed_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duramq_core::model::CallableType;

    fn job() -> Job {
        Job::builder()
            .name("test")
            .callable_type(CallableType::Function)
            .callable(b"f".to_vec())
            .params(b"[]".to_vec())
            .build()
    }

    #[tokio::test]
    async fn claim_marks_processing_and_returns_the_row() {
        let storage = InMemoryStoragePort::new();
        let id = storage.enqueue(&job()).await.unwrap();
        let claimed = storage.claim_ready("pid-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);

        let row = storage.find(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Processing);
        assert_eq!(row.pid.as_deref(), Some("pid-1"));
    }

    #[tokio::test]
    async fn exhausting_retry_budget_dead_letters_the_job() {
        let storage = InMemoryStoragePort::new();
        let mut j = job();
        j.max_retries = 0;
        let id = storage.enqueue(&j).await.unwrap();
        storage.mark_failed(id, "boom", "{}").await.unwrap();

        let row = storage.find(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        let failed = storage.list_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, id);
    }

    #[tokio::test]
    async fn retry_all_failed_requeues_only_jobs_with_remaining_budget() {
        let storage = InMemoryStoragePort::new();

        let mut exhausted = job();
        exhausted.max_retries = 0;
        let exhausted_id = storage.enqueue(&exhausted).await.unwrap();
        storage.mark_failed(exhausted_id, "boom", "{}").await.unwrap();

        let mut recoverable = job();
        recoverable.max_retries = 5;
        recoverable.status = JobStatus::Failed;
        recoverable.retry_count = 1;
        let recoverable_id = storage.enqueue(&recoverable).await.unwrap();

        let count = storage.retry_all_failed().await.unwrap();
        assert_eq!(count, 1);

        let still_failed = storage.find(exhausted_id).await.unwrap().unwrap();
        assert_eq!(still_failed.status, JobStatus::Failed);

        let requeued = storage.find(recoverable_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.retry_count, 2);
    }

    #[tokio::test]
    async fn retry_failed_resets_a_dead_lettered_job() {
        let storage = InMemoryStoragePort::new();
        let mut j = job();
        j.max_retries = 0;
        let id = storage.enqueue(&j).await.unwrap();
        storage.mark_failed(id, "boom", "{}").await.unwrap();

        let failed = storage.list_failed(10).await.unwrap();
        storage.retry_failed(failed[0].id).await.unwrap();

        let row = storage.find(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.retry_count, 0);
    }
}
