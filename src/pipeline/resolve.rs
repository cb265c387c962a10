//! Manual resolution: the synchronous terminal transition out of
//! `manual_review`, invoked by the review HTTP surface.

use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{detection_queries, image_queries};
use crate::models::ImageStatus;
use crate::services::storage::{BlobPaths, BlobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveAction {
    /// Pick one detection; every other detection is rejected.
    Choose,
    /// There is no readable barcode; reject everything.
    NoBarcode,
    /// Leave the image in review untouched.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(ImageStatus),
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("image not found")]
    ImageNotFound,

    #[error("image is not awaiting manual review")]
    NotInReview,

    #[error("action 'choose' requires a detection_id")]
    MissingDetectionId,

    #[error("detection not found for this image")]
    UnknownDetection,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Apply a reviewer's decision to an image in `manual_review`.
pub async fn resolve_image(
    pool: &PgPool,
    store: &Arc<dyn BlobStore>,
    image_id: &str,
    action: ResolveAction,
    detection_id: Option<Uuid>,
    reviewer: Option<&str>,
) -> Result<ResolveOutcome, ResolveError> {
    let image = image_queries::get_image(pool, image_id)
        .await?
        .ok_or(ResolveError::ImageNotFound)?;

    if image.status != ImageStatus::ManualReview {
        return Err(ResolveError::NotInReview);
    }

    let new_status = match action {
        ResolveAction::Skip => return Ok(ResolveOutcome::Skipped),
        ResolveAction::Choose => {
            let detection_id = detection_id.ok_or(ResolveError::MissingDetectionId)?;
            if !detection_queries::mark_chosen(pool, detection_id, image_id, reviewer).await? {
                return Err(ResolveError::UnknownDetection);
            }
            detection_queries::reject_others(pool, image_id, detection_id, reviewer).await?;
            ImageStatus::DecodedManual
        }
        ResolveAction::NoBarcode => {
            detection_queries::reject_all(pool, image_id, reviewer).await?;
            ImageStatus::Failed
        }
    };

    // Move the working artifact to its terminal folder; blob placement is
    // best-effort, the status transition is the source of truth.
    if let Some(current_path) = image.final_blob_path.as_deref() {
        let dest = match new_status {
            ImageStatus::DecodedManual => BlobPaths::processed(&image.batch_id, &image.image_id),
            _ => BlobPaths::failed(&image.batch_id, &image.image_id),
        };
        if dest != current_path {
            match store.move_blob(current_path, &dest).await {
                Ok(()) => {
                    image_queries::set_final_blob_path(pool, image_id, &dest).await?;
                }
                Err(e) => {
                    tracing::warn!(image_id, error = %e, "could not move reviewed artifact");
                }
            }
        }
    }

    if !image_queries::transition(pool, image_id, ImageStatus::ManualReview, new_status).await? {
        return Err(ResolveError::NotInReview);
    }

    tracing::info!(
        image_id,
        action = ?action,
        new_status = %new_status,
        reviewer = reviewer.unwrap_or("unknown"),
        "manual review resolved"
    );

    Ok(ResolveOutcome::Resolved(new_status))
}
