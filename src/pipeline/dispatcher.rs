//! Dispatcher: reaps expired leases and seeds the queue from image states.
//!
//! Logically single-instance, but safe to run redundantly because every
//! enqueue is idempotent per `(job_type, image_id)` while a job is active.

use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;

use crate::db::image_queries;
use crate::models::JobType;
use crate::pipeline::MAX_FALLBACK_ATTEMPTS;
use crate::services::queue::{JobQueue, QueueError};

/// Minimum age of a failed image before it is retried.
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// The primary decoder is deterministic; one retry only covers I/O faults.
const PRIMARY_MAX_RETRIES: i32 = 1;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub reaped: u64,
    pub preprocess: usize,
    pub decode_primary: usize,
    pub decode_fallback: usize,
    pub failed_retries: usize,
}

impl DispatchSummary {
    pub fn total_enqueued(&self) -> usize {
        self.preprocess + self.decode_primary + self.decode_fallback + self.failed_retries
    }
}

pub struct Dispatcher {
    pool: PgPool,
    queue: JobQueue,
    batch_size: i64,
    max_retries: i32,
}

impl Dispatcher {
    pub fn new(pool: PgPool, queue: JobQueue, batch_size: i64, max_retries: i32) -> Self {
        Self {
            pool,
            queue,
            batch_size,
            max_retries,
        }
    }

    /// One dispatch cycle: reap, then seed each stage, each bounded by
    /// `batch_size`.
    pub async fn run_cycle(&self) -> Result<DispatchSummary, DispatchError> {
        let mut summary = DispatchSummary {
            reaped: self.queue.reap().await?,
            ..Default::default()
        };

        summary.preprocess = self.seed_preprocess().await?;
        summary.decode_primary = self.seed_primary().await?;
        summary.decode_fallback = self.seed_fallback().await?;
        summary.failed_retries = self.seed_failed_retries().await?;

        if summary.total_enqueued() > 0 || summary.reaped > 0 {
            tracing::info!(
                reaped = summary.reaped,
                preprocess = summary.preprocess,
                decode_primary = summary.decode_primary,
                decode_fallback = summary.decode_fallback,
                failed_retries = summary.failed_retries,
                "dispatch cycle complete"
            );
        }

        metrics::counter!("pipeline_jobs_dispatched_total")
            .increment(summary.total_enqueued() as u64);

        Ok(summary)
    }

    async fn seed_preprocess(&self) -> Result<usize, DispatchError> {
        let pending = image_queries::find_by_status(
            &self.pool,
            crate::models::ImageStatus::Pending,
            self.batch_size,
        )
        .await?;

        let mut created = 0;
        for image in pending {
            let result = self
                .queue
                .enqueue(
                    JobType::Preprocess,
                    &image.image_id,
                    &image.batch_id,
                    0,
                    None,
                    self.max_retries,
                )
                .await?;
            if result.created {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn seed_primary(&self) -> Result<usize, DispatchError> {
        let ready = image_queries::find_awaiting_primary(&self.pool, self.batch_size).await?;

        let mut created = 0;
        for image in ready {
            let result = self
                .queue
                .enqueue(
                    JobType::DecodePrimary,
                    &image.image_id,
                    &image.batch_id,
                    0,
                    None,
                    PRIMARY_MAX_RETRIES,
                )
                .await?;
            if result.created {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn seed_fallback(&self) -> Result<usize, DispatchError> {
        let flagged = image_queries::find_needing_fallback(&self.pool, self.batch_size).await?;

        let mut created = 0;
        for image in flagged {
            let result = self
                .queue
                .enqueue(
                    JobType::DecodeFallback,
                    &image.image_id,
                    &image.batch_id,
                    0,
                    None,
                    self.max_retries,
                )
                .await?;
            if result.created {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Failed images re-enter fallback while attempt budget remains and the
    /// last attempt is old enough.
    async fn seed_failed_retries(&self) -> Result<usize, DispatchError> {
        let retryable = image_queries::find_failed_for_retry(
            &self.pool,
            self.batch_size,
            MAX_FALLBACK_ATTEMPTS,
            RETRY_DELAY,
        )
        .await?;

        let mut created = 0;
        for image in retryable {
            let result = self
                .queue
                .enqueue(
                    JobType::DecodeFallback,
                    &image.image_id,
                    &image.batch_id,
                    0,
                    None,
                    self.max_retries,
                )
                .await?;
            if result.created {
                created += 1;
            }
        }
        Ok(created)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
