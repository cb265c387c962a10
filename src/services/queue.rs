//! Durable job queue over the metadata store.
//!
//! Jobs are leased, not popped: a worker that crashes mid-job loses its lease
//! and the dispatcher's reap pass returns the job to `pending`. Enqueue is
//! idempotent per `(job_type, image_id)` while an active job exists, enforced
//! by a partial unique index so concurrent dispatchers cannot double-enqueue.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{Job, JobType};

const JOB_COLUMNS: &str = "job_id, job_type, image_id, batch_id, status, priority, attempt, \
     max_retries, worker_id, started_at, completed_at, scheduled_for, lock_until, result, \
     error, error_details, created_at, updated_at";

/// Retry backoff: 30s, 60s, 120s, then capped at 120s.
pub fn backoff(attempt: i32) -> Duration {
    let shift = attempt.saturating_sub(1).clamp(0, 8) as u32;
    Duration::from_secs((30u64 << shift).min(120))
}

/// Outcome of [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy)]
pub struct EnqueueResult {
    pub job_id: Uuid,
    /// False when an active job for the pair already existed.
    pub created: bool,
}

/// Outcome of [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Rescheduled with backoff.
    Requeued,
    /// Retry budget exhausted (or non-retriable); terminally failed.
    Dead,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a job, returning the existing one if an active job for
    /// `(job_type, image_id)` is already pending or in progress.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        image_id: &str,
        batch_id: &str,
        priority: i32,
        scheduled_for: Option<DateTime<Utc>>,
        max_retries: i32,
    ) -> Result<EnqueueResult, QueueError> {
        let scheduled_for = scheduled_for.unwrap_or_else(Utc::now);

        let inserted: Option<Uuid> = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            INSERT INTO jobs (job_type, image_id, batch_id, priority, scheduled_for, max_retries)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_type, image_id) WHERE status IN ('pending', 'in_progress')
            DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(job_type)
        .bind(image_id)
        .bind(batch_id)
        .bind(priority)
        .bind(scheduled_for)
        .bind(max_retries)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job_id) = inserted {
            return Ok(EnqueueResult {
                job_id,
                created: true,
            });
        }

        let existing: Uuid = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            SELECT job_id FROM jobs
            WHERE job_type = $1 AND image_id = $2 AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(job_type)
        .bind(image_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(EnqueueResult {
            job_id: existing,
            created: false,
        })
    }

    /// Atomically lease the highest-priority due job of this type. Increments
    /// the attempt counter and stamps the lease deadline.
    pub async fn lease(
        &self,
        job_type: JobType,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<Uuid> = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            SELECT job_id FROM jobs
            WHERE job_type = $1 AND status = 'pending' AND scheduled_for <= NOW()
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_type)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = candidate else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let job: Job = sqlx::query_as::<Postgres, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'in_progress',
                worker_id = $2,
                started_at = NOW(),
                attempt = attempt + 1,
                lock_until = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE job_id = $1
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_duration.as_secs_f64())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            image_id = %job.image_id,
            attempt = job.attempt,
            "job leased"
        );

        Ok(Some(job))
    }

    /// Extend a worker's lease. Returns false when the job is no longer this
    /// worker's (cancelled, reaped, or reassigned) — the worker must abandon.
    pub async fn renew(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_until = NOW() + make_interval(secs => $3), updated_at = NOW()
            WHERE job_id = $1 AND worker_id = $2 AND status = 'in_progress'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_duration.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn complete(
        &self,
        job_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                completed_at = NOW(),
                lock_until = NULL,
                result = $2,
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %job_id, "job completed");
        Ok(())
    }

    /// Record a failure. Retriable failures with remaining budget go back to
    /// `pending` with backoff; everything else is terminally failed.
    pub async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        error_details: Option<serde_json::Value>,
        retriable: bool,
    ) -> Result<FailDisposition, QueueError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i32, i32)> = sqlx::query_as::<Postgres, (i32, i32)>(
            "SELECT attempt, max_retries FROM jobs WHERE job_id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempt, max_retries)) = row else {
            tx.rollback().await.ok();
            return Err(QueueError::UnknownJob(job_id));
        };

        let disposition = if retriable && attempt < max_retries {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    worker_id = NULL,
                    lock_until = NULL,
                    scheduled_for = NOW() + make_interval(secs => $2),
                    error = $3,
                    error_details = $4,
                    updated_at = NOW()
                WHERE job_id = $1
                "#,
            )
            .bind(job_id)
            .bind(backoff(attempt).as_secs_f64())
            .bind(error)
            .bind(&error_details)
            .execute(&mut *tx)
            .await?;
            FailDisposition::Requeued
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    completed_at = NOW(),
                    lock_until = NULL,
                    error = $2,
                    error_details = $3,
                    updated_at = NOW()
                WHERE job_id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .bind(&error_details)
            .execute(&mut *tx)
            .await?;
            FailDisposition::Dead
        };

        tx.commit().await?;

        tracing::info!(
            job_id = %job_id,
            attempt,
            max_retries,
            requeued = disposition == FailDisposition::Requeued,
            error,
            "job failed"
        );

        Ok(disposition)
    }

    /// Reclaim jobs whose lease expired: back to `pending` with backoff while
    /// retry budget remains, terminally failed otherwise.
    pub async fn reap(&self) -> Result<u64, QueueError> {
        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                lock_until = NULL,
                scheduled_for = NOW()
                    + make_interval(secs => LEAST(30 * power(2, GREATEST(attempt - 1, 0)), 120)),
                error = 'lease expired',
                updated_at = NOW()
            WHERE status = 'in_progress' AND lock_until < NOW() AND attempt < max_retries
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        let dead = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                completed_at = NOW(),
                lock_until = NULL,
                error = 'lease expired',
                updated_at = NOW()
            WHERE status = 'in_progress' AND lock_until < NOW() AND attempt >= max_retries
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if requeued + dead > 0 {
            tracing::warn!(requeued, dead, "reaped expired job leases");
        }
        Ok(requeued + dead)
    }

    /// Cancel a job that has not finished. In-flight workers notice on their
    /// next lease renewal and abandon the attempt.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                completed_at = NOW(),
                lock_until = NULL,
                updated_at = NOW()
            WHERE job_id = $1 AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<Postgres, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Pending jobs due now, by type (queue-depth gauge).
    pub async fn pending_depth(&self, job_type: JobType) -> Result<i64, QueueError> {
        let depth: i64 = sqlx::query_scalar::<Postgres, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE job_type = $1 AND status = 'pending' AND scheduled_for <= NOW()
            "#,
        )
        .bind(job_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(depth)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("unknown job: {0}")]
    UnknownJob(Uuid),
}
