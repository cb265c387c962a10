//! The pipeline coordinator: stage handlers, the worker runtime that leases
//! and executes jobs, and the dispatcher that feeds the queue from image
//! states.

pub mod decode_fallback;
pub mod decode_primary;
pub mod dispatcher;
pub mod preprocess;
pub mod resolve;
pub mod worker;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::product_queries;
use crate::models::Job;
use crate::services::gemini::LlmError;
use crate::services::normalize::NormalizeError;
use crate::services::queue::QueueError;
use crate::services::storage::StorageError;
use crate::services::zbar::DecodeError;

/// Fallback attempts are capped per image, across all jobs.
pub const MAX_FALLBACK_ATTEMPTS: i32 = 3;

/// What a stage handler produced.
#[derive(Debug)]
pub enum StageOutcome {
    /// Stage ran and committed its transition; summary goes into the job.
    Done(serde_json::Value),
    /// Another worker advanced the image first; nothing to do.
    Skipped,
}

/// Stage failure, classified for the queue's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Transient I/O (blob, DB, network): retriable with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Upstream rate limit: retriable, the backoff floor does the waiting.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Bad input (unreadable blob, wrong format): retrying cannot help.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StageError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, StageError::InvalidInput(_))
    }
}

impl From<sqlx::Error> for StageError {
    fn from(e: sqlx::Error) -> Self {
        StageError::Transient(format!("database: {e}"))
    }
}

impl From<QueueError> for StageError {
    fn from(e: QueueError) -> Self {
        StageError::Transient(format!("queue: {e}"))
    }
}

impl From<StorageError> for StageError {
    fn from(e: StorageError) -> Self {
        StageError::Transient(format!("storage: {e}"))
    }
}

impl From<DecodeError> for StageError {
    fn from(e: DecodeError) -> Self {
        StageError::Transient(format!("primary decoder: {e}"))
    }
}

impl From<LlmError> for StageError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited => StageError::RateLimited("model API".to_string()),
            // An unparseable response is worth retrying: the model is not
            // deterministic and the next attempt may produce clean JSON.
            other => StageError::Transient(format!("fallback decoder: {other}")),
        }
    }
}

impl From<NormalizeError> for StageError {
    fn from(e: NormalizeError) -> Self {
        StageError::InvalidInput(e.to_string())
    }
}

/// One pipeline stage. Handlers own their image-side effects: they claim the
/// image with a conditional transition, do the work, and commit the exit
/// transition themselves, reporting `Skipped` when a conditional update finds
/// the image already advanced.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name recorded in image error history and logs.
    fn stage(&self) -> &'static str;

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError>;

    /// Applied when the job dies non-retriably (or exhausts retries on a
    /// non-retriable classification); moves the image to whatever terminal
    /// state fits the stage.
    async fn fail_permanently(&self, job: &Job, error: &StageError);
}

/// Catalog annotation shared by the decode stages.
pub(crate) async fn product_lookup(pool: &PgPool, code: &str) -> (bool, Option<String>) {
    match product_queries::get_by_any_code(pool, code).await {
        Ok(Some(product)) => (true, Some(product.id.to_string())),
        Ok(None) => (false, None),
        Err(e) => {
            // Catalog annotation is best-effort; a lookup failure must not
            // fail the decode.
            tracing::warn!(code, error = %e, "product lookup failed");
            (false, None)
        }
    }
}
