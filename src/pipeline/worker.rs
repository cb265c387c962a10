//! Worker runtime: poll, lease, execute under a deadline, commit.
//!
//! The handler runs with a wall-clock budget of `lock_until - safety_margin`.
//! While it runs, the worker renews its lease periodically; if a renewal
//! discovers the job is no longer ours (cancelled or reaped), the attempt is
//! abandoned and another worker may pick the job up after lease expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::time::sleep;
use tracing::Instrument;
use uuid::Uuid;

use crate::db::image_queries;
use crate::models::JobType;
use crate::pipeline::{StageError, StageHandler, StageOutcome};
use crate::services::queue::JobQueue;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub lease_duration: Duration,
    /// Subtracted from the lease to form the handler deadline, leaving room
    /// to commit or abandon before the lease lapses.
    pub safety_margin: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            lease_duration: Duration::from_secs(300),
            safety_margin: Duration::from_secs(15),
        }
    }
}

/// How the poll loop terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One poll batch, then exit.
    Once,
    /// Exit after two consecutive empty polls (batch drain).
    UntilDrained,
    /// Keep polling forever.
    Continuous,
}

pub struct Worker {
    worker_id: String,
    job_type: JobType,
    handler: Arc<dyn StageHandler>,
    queue: JobQueue,
    pool: PgPool,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        job_type: JobType,
        handler: Arc<dyn StageHandler>,
        queue: JobQueue,
        pool: PgPool,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = format!("{}-{}", handler.stage(), Uuid::new_v4().simple());
        Self {
            worker_id,
            job_type,
            handler,
            queue,
            pool,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Main loop. Returns the total number of jobs processed.
    pub async fn run(&self, mode: RunMode) -> usize {
        tracing::info!(
            worker_id = %self.worker_id,
            job_type = %self.job_type,
            batch_size = self.config.batch_size,
            "worker started"
        );

        let mut total = 0usize;
        let mut consecutive_empty = 0u32;

        loop {
            let processed = match self.poll_batch().await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, error = %e, "poll failed");
                    0
                }
            };
            total += processed;

            if matches!(mode, RunMode::Once) {
                break;
            }

            if processed == 0 {
                consecutive_empty += 1;
                if matches!(mode, RunMode::UntilDrained) && consecutive_empty >= 2 {
                    tracing::info!(worker_id = %self.worker_id, "no more work, exiting");
                    break;
                }
                sleep(self.config.poll_interval).await;
            } else {
                consecutive_empty = 0;
            }
        }

        total
    }

    /// Lease and process up to `batch_size` jobs.
    pub async fn poll_batch(&self) -> Result<usize, StageError> {
        let mut processed = 0usize;

        for _ in 0..self.config.batch_size {
            let job = self
                .queue
                .lease(self.job_type, &self.worker_id, self.config.lease_duration)
                .await?;

            let Some(job) = job else {
                break;
            };

            self.process_job(job).await;
            processed += 1;
        }

        Ok(processed)
    }

    async fn process_job(&self, job: crate::models::Job) {
        let span = tracing::info_span!(
            "job",
            job_id = %job.job_id,
            job_type = %job.job_type,
            image_id = %job.image_id,
            attempt = job.attempt,
        );
        self.process_job_inner(job).instrument(span).await
    }

    async fn process_job_inner(&self, job: crate::models::Job) {
        let started = std::time::Instant::now();
        let outcome = self.execute_leased(&job).await;

        metrics::histogram!("pipeline_stage_duration_seconds", "stage" => self.handler.stage())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            None => {
                // Lease lost mid-flight; whatever we did before the last
                // committed transition is superseded. Say nothing to the
                // queue: reap owns this job now.
                tracing::warn!("lease lost, attempt abandoned");
            }
            Some(Ok(StageOutcome::Done(result))) => {
                metrics::counter!(
                    "pipeline_jobs_processed_total",
                    "stage" => self.handler.stage(), "outcome" => "done"
                )
                .increment(1);
                if let Err(e) = self.queue.complete(job.job_id, Some(result)).await {
                    tracing::error!(error = %e, "failed to complete job");
                }
            }
            Some(Ok(StageOutcome::Skipped)) => {
                metrics::counter!(
                    "pipeline_jobs_processed_total",
                    "stage" => self.handler.stage(), "outcome" => "skipped"
                )
                .increment(1);
                let result = serde_json::json!({ "skipped": true });
                if let Err(e) = self.queue.complete(job.job_id, Some(result)).await {
                    tracing::error!(error = %e, "failed to complete skipped job");
                }
            }
            Some(Err(error)) => {
                metrics::counter!(
                    "pipeline_jobs_processed_total",
                    "stage" => self.handler.stage(), "outcome" => "error"
                )
                .increment(1);
                self.handle_failure(&job, error).await;
            }
        }
    }

    /// Run the handler under the lease deadline, renewing as we go.
    /// `None` means the attempt was abandoned because the lease was lost.
    async fn execute_leased(
        &self,
        job: &crate::models::Job,
    ) -> Option<Result<StageOutcome, StageError>> {
        let deadline = job
            .lock_until
            .map(|lock_until| lock_until - chrono::Duration::from_std(self.config.safety_margin).unwrap_or_default())
            .unwrap_or_else(Utc::now);
        let budget = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let renew_every = self.config.lease_duration / 3;
        let mut renew = tokio::time::interval(renew_every.max(Duration::from_secs(1)));
        renew.tick().await; // consume the immediate first tick

        let handler = Arc::clone(&self.handler);
        let fut = handler.execute(job);
        tokio::pin!(fut);

        let deadline_sleep = sleep(budget);
        tokio::pin!(deadline_sleep);

        loop {
            tokio::select! {
                result = &mut fut => return Some(result),
                () = &mut deadline_sleep => {
                    return Some(Err(StageError::Transient(
                        "handler deadline exceeded".to_string(),
                    )));
                }
                _ = renew.tick() => {
                    match self
                        .queue
                        .renew(job.job_id, &self.worker_id, self.config.lease_duration)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => return None,
                        Err(e) => {
                            // Transient renewal trouble; the deadline still
                            // bounds us, keep working.
                            tracing::warn!(error = %e, "lease renewal errored");
                        }
                    }
                }
            }
        }
    }

    async fn handle_failure(&self, job: &crate::models::Job, error: StageError) {
        tracing::error!(error = %error, retriable = error.is_retriable(), "stage failed");

        if let Err(e) = image_queries::add_processing_error(
            &self.pool,
            &job.image_id,
            self.handler.stage(),
            &error.to_string(),
            None,
        )
        .await
        {
            tracing::error!(error = %e, "failed to record image error");
        }

        match self
            .queue
            .fail(job.job_id, &error.to_string(), None, error.is_retriable())
            .await
        {
            Ok(disposition) => {
                if !error.is_retriable() {
                    self.handler.fail_permanently(job, &error).await;
                } else if disposition == crate::services::queue::FailDisposition::Dead {
                    // Retriable classification but the budget ran out.
                    self.handler.fail_permanently(job, &error).await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to record job failure");
            }
        }
    }
}
