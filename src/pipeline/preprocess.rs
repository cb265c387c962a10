//! Preprocess stage: normalize the incoming image, produce rotation
//! variants, archive the source blob, and advance to `preprocessed`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;

use crate::db::image_queries;
use crate::models::{Job, PreprocessingInfo};
use crate::pipeline::{StageError, StageHandler, StageOutcome};
use crate::services::normalize::{ImageNormalizer, NormalizeError, NormalizeOptions};
use crate::services::storage::{BlobPaths, BlobStore};

pub struct PreprocessHandler {
    pool: PgPool,
    store: Arc<dyn BlobStore>,
    normalizer: Arc<dyn ImageNormalizer>,
    options: NormalizeOptions,
}

impl PreprocessHandler {
    pub fn new(
        pool: PgPool,
        store: Arc<dyn BlobStore>,
        normalizer: Arc<dyn ImageNormalizer>,
        options: NormalizeOptions,
    ) -> Self {
        debug_assert!(options.rotations.contains(&0), "rotation set must include 0");
        Self {
            pool,
            store,
            normalizer,
            options,
        }
    }
}

#[async_trait]
impl StageHandler for PreprocessHandler {
    fn stage(&self) -> &'static str {
        "preprocess"
    }

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError> {
        let Some(image) = image_queries::get_image(&self.pool, &job.image_id).await? else {
            return Err(StageError::InvalidInput(format!(
                "image {} not found",
                job.image_id
            )));
        };

        if !image_queries::begin_preprocess(&self.pool, &image.image_id).await? {
            return Ok(StageOutcome::Skipped);
        }

        let source = self.store.download(&image.source_path).await?;
        if source.is_empty() {
            return Err(StageError::InvalidInput("source blob is empty".to_string()));
        }
        if image::guess_format(&source).is_err() {
            return Err(StageError::InvalidInput(
                "source blob is not a recognized image format".to_string(),
            ));
        }

        // CPU-bound normalization off the async runtime.
        let normalizer = Arc::clone(&self.normalizer);
        let options = self.options.clone();
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&source, &options))
            .await
            .map_err(|e| StageError::Transient(format!("normalize task panicked: {e}")))?
            .map_err(|e: NormalizeError| StageError::from(e))?;

        let normalized_path = BlobPaths::preprocessed(&image.batch_id, &image.image_id);
        self.store
            .upload(&normalized_path, &normalized.bytes, "image/jpeg")
            .await?;

        for variant in &normalized.rotations {
            let path = BlobPaths::rotation(&image.batch_id, &image.image_id, variant.angle);
            self.store.upload(&path, &variant.bytes, "image/jpeg").await?;
        }

        // Archive the source. The move is copy-then-delete and tolerates a
        // failed delete, so a crash here never strands the image.
        let archive_path = BlobPaths::original(&image.batch_id, &image.source_filename);
        if let Err(e) = self.store.move_blob(&image.source_path, &archive_path).await {
            tracing::warn!(
                image_id = %image.image_id,
                error = %e,
                "failed to archive source blob, continuing"
            );
        }

        let mut rotations_generated: Vec<u16> = vec![0];
        rotations_generated.extend(normalized.rotations.iter().map(|r| r.angle));

        let prep = PreprocessingInfo {
            normalized_path: Some(normalized_path),
            original_width: Some(normalized.original_width),
            original_height: Some(normalized.original_height),
            processed_width: Some(normalized.processed_width),
            processed_height: Some(normalized.processed_height),
            grayscale: normalized.grayscale,
            clahe_applied: normalized.clahe_applied,
            denoised: normalized.denoised,
            rotations_generated,
            duration_ms: Some(normalized.duration_ms),
            completed_at: Some(Utc::now()),
        };

        if !image_queries::complete_preprocess(&self.pool, &image.image_id, &prep).await? {
            return Ok(StageOutcome::Skipped);
        }

        tracing::info!(
            image_id = %image.image_id,
            batch_id = %image.batch_id,
            duration_ms = normalized.duration_ms,
            rotations = prep.rotations_generated.len(),
            "image preprocessed"
        );

        Ok(StageOutcome::Done(serde_json::json!({
            "duration_ms": normalized.duration_ms,
            "rotations": prep.rotations_generated,
        })))
    }

    async fn fail_permanently(&self, job: &Job, error: &StageError) {
        tracing::warn!(
            image_id = %job.image_id,
            error = %error,
            "preprocessing failed permanently, marking image failed"
        );
        if let Err(e) = image_queries::transition(
            &self.pool,
            &job.image_id,
            crate::models::ImageStatus::Preprocessing,
            crate::models::ImageStatus::Failed,
        )
        .await
        {
            tracing::error!(image_id = %job.image_id, error = %e, "failed to mark image failed");
        }
    }
}
