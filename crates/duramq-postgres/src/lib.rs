//! PostgreSQL `StoragePort` implementation.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE duramq_jobs (
//!     id BIGSERIAL PRIMARY KEY,
//!     uuid UUID NOT NULL,
//!     name TEXT NOT NULL,
//!     callable_type TEXT NOT NULL,
//!     callable BYTEA NOT NULL,
//!     namespace TEXT,
//!     object_instance BYTEA,
//!     path_files TEXT,
//!     params BYTEA NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     priority SMALLINT NOT NULL DEFAULT 2,
//!     pid TEXT,
//!     timeout BIGINT NOT NULL DEFAULT 14400,
//!     retry_count INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 3,
//!     retry_delay BIGINT NOT NULL DEFAULT 5,
//!     started_at TIMESTAMPTZ,
//!     completed_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE duramq_failed_jobs (
//!     id BIGSERIAL PRIMARY KEY,
//!     uuid UUID NOT NULL,
//!     job_id BIGINT NOT NULL,
//!     exception TEXT NOT NULL,
//!     payload TEXT NOT NULL,
//!     failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_duramq_jobs_ready ON duramq_jobs (priority, created_at, id)
//!     WHERE status = 'pending';
//! ```
//!
//! `claim_ready` uses `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! double-claim the same row, orders by `(priority, created_at, id)` so two
//! jobs enqueued in the same instant still claim in a fixed order, and
//! guards against a malformed row (`retry_count >= max_retries` but still
//! `pending`) slipping back into rotation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duramq_core::model::{CallableType, FailedJob, Job, JobStatus, Priority};
use duramq_core::retry::backoff_seconds;
use duramq_core::storage::{QueueStats, StoragePort};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgStoragePort {
    pool: PgPool,
}

impl PgStoragePort {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded DDL. Intended for local development and tests;
    /// production deployments should manage the schema with a migration
    /// tool instead.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS duramq_jobs (
                id BIGSERIAL PRIMARY KEY,
                uuid UUID NOT NULL,
                name TEXT NOT NULL,
                callable_type TEXT NOT NULL,
                callable BYTEA NOT NULL,
                namespace TEXT,
                object_instance BYTEA,
                path_files TEXT,
                params BYTEA NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority SMALLINT NOT NULL DEFAULT 2,
                pid TEXT,
                timeout BIGINT NOT NULL DEFAULT 14400,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_delay BIGINT NOT NULL DEFAULT 5,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS duramq_failed_jobs (
                id BIGSERIAL PRIMARY KEY,
                uuid UUID NOT NULL,
                job_id BIGINT NOT NULL,
                exception TEXT NOT NULL,
                payload TEXT NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job> {
    let status_str: String = row.try_get("status")?;
    let priority_rank: i16 = row.try_get("priority")?;
    let callable_type_str: String = row.try_get("callable_type")?;

    Ok(Job {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
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
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn rank_to_priority(rank: i16) -> Priority {
    match rank {
        0 => Priority::Urgent,
        1 => Priority::High,
        3 => Priority::Low,
        _ => Priority::Normal,
    }
}

fn row_to_failed_job(row: &sqlx::postgres::PgRow) -> Result<FailedJob> {
    Ok(FailedJob {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        job_id: row.try_get("job_id")?,
        exception: row.try_get("exception")?,
        payload: row.try_get("payload")?,
        failed_at: row.try_get("failed_at")?,
    })
}

#[async_trait]
impl StoragePort for PgStoragePort {
    async fn enqueue(&self, job: &Job) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO duramq_jobs
                (uuid, name, callable_type, callable, namespace, object_instance,
                 path_files, params, status, priority, timeout, retry_count,
                 max_retries, retry_delay, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(job.uuid)
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
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn claim_ready(&self, pid: &str, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM duramq_jobs
                WHERE status = 'pending'
                  AND (retry_count < max_retries OR retry_count = 0)
                ORDER BY priority ASC, created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE duramq_jobs
            SET status = 'processing',
                pid = $2,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(limit)
        .bind(pid)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn mark_completed(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE duramq_jobs
            SET status = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: i64, exception: &str, payload: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM duramq_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        let job = row_to_job(&row)?;

        if job.has_retry_budget() {
            let delay_secs = backoff_seconds(&job);
            sqlx::query(
                r#"
                UPDATE duramq_jobs
                SET status = 'pending',
                    retry_count = retry_count + 1,
                    pid = NULL,
                    updated_at = NOW() + make_interval(secs => $1)
                WHERE id = $2
                "#,
            )
            .bind(delay_secs as f64)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE duramq_jobs
                SET status = 'failed', updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO duramq_failed_jobs (uuid, job_id, exception, payload, failed_at)
                VALUES ($1, $2, $3, $4, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job_id)
            .bind(exception)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn dead_letter(&self, job_id: i64, exception: &str, payload: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE duramq_jobs
            SET status = 'failed', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO duramq_failed_jobs (uuid, job_id, exception, payload, failed_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(exception)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, job_id: i64) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM duramq_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM duramq_jobs WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE duramq_jobs
            SET status = 'pending', pid = NULL, updated_at = NOW()
            WHERE status = 'processing' AND started_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                AVG(EXTRACT(EPOCH FROM (completed_at - created_at)))
                    FILTER (WHERE status = 'completed') AS avg_completion_secs
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
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            dead_lettered,
            avg_completion_secs: row.try_get("avg_completion_secs")?,
        })
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<FailedJob>> {
        let rows = sqlx::query("SELECT * FROM duramq_failed_jobs ORDER BY failed_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_failed_job).collect()
    }

    async fn retry_failed(&self, failed_job_id: i64) -> Result<()> {
        let row = sqlx::query("SELECT job_id FROM duramq_failed_jobs WHERE id = $1")
            .bind(failed_job_id)
            .fetch_one(&self.pool)
            .await?;
        let job_id: i64 = row.try_get("job_id")?;

        sqlx::query(
            r#"
            UPDATE duramq_jobs
            SET status = 'pending', retry_count = 0, pid = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_all_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE duramq_jobs
            SET status = 'pending', retry_count = retry_count + 1, pid = NULL, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM duramq_jobs
                WHERE status = 'failed' AND retry_count < max_retries
                ORDER BY created_at ASC
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_failed_jobs(&self, days_old: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM duramq_failed_jobs WHERE failed_at < NOW() - make_interval(days => $1)",
        )
        .bind(days_old as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM duramq_jobs WHERE status = 'completed' AND completed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duramq_core::model::CallableType;
    use std::env;

    async fn test_pool() -> Option<PgPool> {
        let url = env::var("DATABASE_URL").ok()?;
        PgPool::connect(&url).await.ok()
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
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        let store = PgStoragePort::new(pool);
        store.migrate().await.unwrap();

        let id = store.enqueue(&job()).await.unwrap();
        let claimed = store.claim_ready("pg-test-pid", 10).await.unwrap();
        assert!(claimed.iter().any(|j| j.id == id));

        store.mark_completed(id).await.unwrap();
        let row = store.find(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
    }
}
