//! SQLite `StoragePort` implementation.
//!
//! SQLite has no row-level locking, so `FOR UPDATE SKIP LOCKED` is not an
//! option here the way it is on Postgres. `claim_ready` instead opens a
//! `BEGIN IMMEDIATE` transaction, which takes SQLite's database-wide
//! write lock up front: any other writer (another claim, a dispatch, a
//! mark_failed) blocks until this transaction commits. That serializes
//! claims across the whole database rather than just the claimed rows,
//! which is the honest tradeoff of an embedded, single-writer database —
//! acceptable for the single-process/low-concurrency deployments this
//! driver targets.
//!
//! # Schema
//!
//! Same column set as the Postgres driver (see `duramq_core::schema`),
//! translated to SQLite types: `BYTEA` -> `BLOB`, `TIMESTAMPTZ` -> `TEXT`
//! (RFC 3339), `UUID` -> `TEXT`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duramq_core::model::{CallableType, FailedJob, Job, JobStatus, Priority};
use duramq_core::retry::backoff_seconds;
use duramq_core::storage::{QueueStats, StoragePort};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// SQLite-backed job store.
#[derive(Clone)]
pub struct SqliteStoragePort {
    pool: SqlitePool,
}

impl SqliteStoragePort {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS duramq_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                name TEXT NOT NULL,
                callable_type TEXT NOT NULL,
                callable BLOB NOT NULL,
                namespace TEXT,
                object_instance BLOB,
                path_files TEXT,
                params BLOB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 2,
                pid TEXT,
                timeout INTEGER NOT NULL DEFAULT 14400,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_delay INTEGER NOT NULL DEFAULT 5,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS duramq_failed_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                job_id INTEGER NOT NULL,
                exception TEXT NOT NULL,
                payload TEXT NOT NULL,
                failed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn rank_to_priority(rank: i64) -> Priority {
    match rank {
        0 => Priority::Urgent,
        1 => Priority::High,
        3 => Priority::Low,
        _ => Priority::Normal,
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let status_str: String = row.try_get("status")?;
    let priority_rank: i64 = row.try_get("priority")?;
    let callable_type_str: String = row.try_get("callable_type")?;
    let uuid_str: String = row.try_get("uuid")?;

    Ok(Job {
        id: row.try_get("id")?,
        uuid: Uuid::parse_str(&uuid_str)?,
        name: row.try_get("name")?,
        callable_type: CallableType::parse(&callable_type_str)
            .ok_or_else(|| anyhow::anyhow!("unknown callable_type {callable_type_str}"))?,
        callable: row.try_get("callable")?,
        namespace: row.try_get("namespace")?,
        object_instance: row.try_get("object_instance")?,
        path_files: row.try_get("path_files")?,
        params: row.try_get("params")?,
        status: JobStatus::parse(&status_str)
            .ok_or_else(|| anyhow::anyhow!("unknown status {status_str}"))?,
        priority: rank_to_priority(priority_rank),
        pid: row.try_get("pid")?,
        timeout: row.try_get("timeout")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        retry_delay: row.try_get("retry_delay")?,
        started_at: parse_ts(row.try_get("started_at")?)?,
        completed_at: parse_ts(row.try_get("completed_at")?)?,
        created_at: parse_ts(row.try_get::<Option<String>, _>("created_at")?)?
            .ok_or_else(|| anyhow::anyhow!("created_at is NULL"))?,
        updated_at: parse_ts(row.try_get::<Option<String>, _>("updated_at")?)?
            .ok_or_else(|| anyhow::anyhow!("updated_at is NULL"))?,
    })
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .map_err(Into::into)
}

fn row_to_failed_job(row: &sqlx::sqlite::SqliteRow) -> Result<FailedJob> {
    let uuid_str: String = row.try_get("uuid")?;
    let failed_at: String = row.try_get("failed_at")?;
    Ok(FailedJob {
        id: row.try_get("id")?,
        uuid: Uuid::parse_str(&uuid_str)?,
        job_id: row.try_get("job_id")?,
        exception: row.try_get("exception")?,
        payload: row.try_get("payload")?,
        failed_at: DateTime::parse_from_rfc3339(&failed_at)?.with_timezone(&Utc),
    })
}

#[async_trait]
impl StoragePort for SqliteStoragePort {
    async fn enqueue(&self, job: &Job) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO duramq_jobs
                (uuid, name, callable_type, callable, namespace, object_instance,
                 path_files, params, status, priority, timeout, retry_count,
                 max_retries, retry_delay, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(job.uuid.to_string())
        .bind(&job.name)
        .bind(job.callable_type.as_str())
        .bind(&job.callable)
        .bind(&job.namespace)
        .bind(&job.object_instance)
        .bind(&job.path_files)
        .bind(&job.params)
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(job.timeout)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.retry_delay)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn claim_ready(&self, pid: &str, limit: i64) -> Result<Vec<Job>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let ids: Vec<i64> = sqlx::query(
            "SELECT id FROM duramq_jobs \
             WHERE status = 'pending' AND (retry_count < max_retries OR retry_count = 0) \
             ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|r| r.try_get::<i64, _>("id"))
        .collect::<std::result::Result<_, _>>()?;

        if ids.is_empty() {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            return Ok(Vec::new());
        }

        let now = Utc::now().to_rfc3339();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            sqlx::query(
                "UPDATE duramq_jobs SET status = 'processing', pid = ?, started_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(pid)
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&mut *conn)
            .await?;

            let row = sqlx::query("SELECT * FROM duramq_jobs WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *conn)
                .await?;
            claimed.push(row_to_job(&row)?);
        }

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(claimed)
    }

    async fn mark_completed(&self, job_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE duramq_jobs SET status = 'completed', completed_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: i64, exception: &str, payload: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let row = sqlx::query("SELECT * FROM duramq_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&mut *conn)
            .await?;
        let job = row_to_job(&row)?;

        if job.has_retry_budget() {
            let delay_secs = backoff_seconds(&job);
            let next_eligible = (Utc::now() + chrono::Duration::seconds(delay_secs)).to_rfc3339();
            sqlx::query(
                "UPDATE duramq_jobs SET status = 'pending', retry_count = retry_count + 1, pid = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(&next_eligible)
            .bind(job_id)
            .execute(&mut *conn)
            .await?;
        } else {
            let now = Utc::now().to_rfc3339();
            sqlx::query("UPDATE duramq_jobs SET status = 'failed', updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(job_id)
                .execute(&mut *conn)
                .await?;

            sqlx::query(
                "INSERT INTO duramq_failed_jobs (uuid, job_id, exception, payload, failed_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(job_id)
            .bind(exception)
            .bind(payload)
            .bind(&now)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    }

    async fn dead_letter(&self, job_id: i64, exception: &str, payload: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE duramq_jobs SET status = 'failed', updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(job_id)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            "INSERT INTO duramq_failed_jobs (uuid, job_id, exception, payload, failed_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id)
        .bind(exception)
        .bind(payload)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    }

    async fn find(&self, job_id: i64) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM duramq_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM duramq_jobs WHERE uuid = ?")
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE duramq_jobs SET status = 'pending', pid = NULL, updated_at = ? WHERE status = 'processing' AND started_at < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(older_than.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END) AS processing,
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
                AVG(CASE WHEN status = 'completed'
                    THEN (julianday(completed_at) - julianday(created_at)) * 86400.0
                    END) AS avg_completion_secs
            FROM duramq_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let dead_lettered: i64 = sqlx::query("SELECT COUNT(*) AS n FROM duramq_failed_jobs")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        Ok(QueueStats {
            total: row.try_get("total")?,
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            processing: row.try_get::<Option<i64>, _>("processing")?.unwrap_or(0),
            completed: row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
            dead_lettered,
            avg_completion_secs: row.try_get("avg_completion_secs")?,
        })
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<FailedJob>> {
        let rows = sqlx::query("SELECT * FROM duramq_failed_jobs ORDER BY failed_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_failed_job).collect()
    }

    async fn retry_failed(&self, failed_job_id: i64) -> Result<()> {
        let row = sqlx::query("SELECT job_id FROM duramq_failed_jobs WHERE id = ?")
            .bind(failed_job_id)
            .fetch_one(&self.pool)
            .await?;
        let job_id: i64 = row.try_get("job_id")?;

        sqlx::query(
            "UPDATE duramq_jobs SET status = 'pending', retry_count = 0, pid = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_all_failed(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let ids: Vec<i64> = sqlx::query(
            "SELECT id FROM duramq_jobs WHERE status = 'failed' AND retry_count < max_retries ORDER BY created_at ASC",
        )
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|r| r.try_get::<i64, _>("id"))
        .collect::<std::result::Result<_, _>>()?;

        let now = Utc::now().to_rfc3339();
        for id in &ids {
            sqlx::query(
                "UPDATE duramq_jobs SET status = 'pending', retry_count = retry_count + 1, pid = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(&now)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(ids.len() as u64)
    }

    async fn clear_failed_jobs(&self, days_old: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(days_old)).to_rfc3339();
        let result = sqlx::query("DELETE FROM duramq_failed_jobs WHERE failed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM duramq_jobs WHERE status = 'completed' AND completed_at < ?")
            .bind(older_than.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duramq_core::model::CallableType;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn job() -> Job {
        Job::builder()
            .name("test")
            .callable_type(CallableType::Function)
            .callable(b"f".to_vec())
            .params(b"[]".to_vec())
            .build()
    }

    #[tokio::test]
    async fn enqueue_and_claim_round_trip() {
        let store = SqliteStoragePort::new(test_pool().await);
        store.migrate().await.unwrap();

        let id = store.enqueue(&job()).await.unwrap();
        let claimed = store.claim_ready("sqlite-test-pid", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);

        store.mark_completed(id).await.unwrap();
        let row = store.find(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn failing_within_budget_returns_job_to_pending() {
        let store = SqliteStoragePort::new(test_pool().await);
        store.migrate().await.unwrap();

        let id = store.enqueue(&job()).await.unwrap();
        store.claim_ready("sqlite-test-pid", 10).await.unwrap();
        store.mark_failed(id, "boom", "{}").await.unwrap();

        let row = store.find(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausting_budget_dead_letters_and_records_audit_row() {
        let store = SqliteStoragePort::new(test_pool().await);
        store.migrate().await.unwrap();

        let mut j = job();
        j.max_retries = 0;
        let id = store.enqueue(&j).await.unwrap();
        store.claim_ready("sqlite-test-pid", 10).await.unwrap();
        store.mark_failed(id, "boom", "{}").await.unwrap();

        let row = store.find(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        let failed = store.list_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn stats_counts_match_rows() {
        let store = SqliteStoragePort::new(test_pool().await);
        store.migrate().await.unwrap();
        store.enqueue(&job()).await.unwrap();
        store.enqueue(&job()).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.avg_completion_secs, None);
    }

    #[tokio::test]
    async fn stats_reports_average_completion_latency() {
        let store = SqliteStoragePort::new(test_pool().await);
        store.migrate().await.unwrap();

        let id = store.enqueue(&job()).await.unwrap();
        store.claim_ready("sqlite-test-pid", 10).await.unwrap();
        store.mark_completed(id).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert!(stats.avg_completion_secs.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn find_by_uuid_matches_find_by_id() {
        let store = SqliteStoragePort::new(test_pool().await);
        store.migrate().await.unwrap();

        let j = job();
        let uuid = j.uuid;
        let id = store.enqueue(&j).await.unwrap();

        let by_uuid = store.find_by_uuid(uuid).await.unwrap().unwrap();
        assert_eq!(by_uuid.id, id);
        assert!(store.find_by_uuid(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_all_failed_requeues_only_jobs_with_remaining_budget() {
        let store = SqliteStoragePort::new(test_pool().await);
        store.migrate().await.unwrap();

        let mut exhausted = job();
        exhausted.max_retries = 0;
        let exhausted_id = store.enqueue(&exhausted).await.unwrap();
        store.claim_ready("sqlite-test-pid", 10).await.unwrap();
        store.mark_failed(exhausted_id, "boom", "{}").await.unwrap();

        let mut recoverable = job();
        recoverable.max_retries = 5;
        let recoverable_id = store.enqueue(&recoverable).await.unwrap();
        store.claim_ready("sqlite-test-pid", 10).await.unwrap();
        store.mark_failed(recoverable_id, "boom", "{}").await.unwrap();

        let count = store.retry_all_failed().await.unwrap();
        assert_eq!(count, 1);

        let still_failed = store.find(exhausted_id).await.unwrap().unwrap();
        assert_eq!(still_failed.status, JobStatus::Failed);

        let requeued = store.find(recoverable_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.retry_count, 2);
    }

    #[tokio::test]
    async fn clear_failed_jobs_deletes_only_rows_past_the_window() {
        let store = SqliteStoragePort::new(test_pool().await);
        store.migrate().await.unwrap();

        let mut j = job();
        j.max_retries = 0;
        let id = store.enqueue(&j).await.unwrap();
        store.claim_ready("sqlite-test-pid", 10).await.unwrap();
        store.mark_failed(id, "boom", "{}").await.unwrap();

        assert_eq!(store.clear_failed_jobs(30).await.unwrap(), 0);
        assert_eq!(store.list_failed(10).await.unwrap().len(), 1);

        assert_eq!(store.clear_failed_jobs(0).await.unwrap(), 1);
        assert_eq!(store.list_failed(10).await.unwrap().len(), 0);
    }
}
