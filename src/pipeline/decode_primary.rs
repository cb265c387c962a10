//! Primary decode stage: run the local decoder over the normalized artifact
//! and every rotation variant, validate and persist candidates, and route the
//! image by the number of distinct accepted codes.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::db::{detection_queries, image_queries};
use crate::models::{DetectionSource, Image, ImageStatus, Job, NewDetection};
use crate::pipeline::{product_lookup, StageError, StageHandler, StageOutcome};
use crate::services::barcode;
use crate::services::storage::{BlobPaths, BlobStore};
use crate::services::zbar::PrimaryDecoder;

pub struct DecodePrimaryHandler {
    pool: PgPool,
    store: Arc<dyn BlobStore>,
    decoder: Arc<dyn PrimaryDecoder>,
}

/// A validated candidate, pre-insert.
struct Candidate {
    raw: String,
    symbology: barcode::BarcodeSymbology,
    normalized: Option<String>,
    flags: barcode::ValidationFlags,
    rotation: u16,
}

impl DecodePrimaryHandler {
    pub fn new(pool: PgPool, store: Arc<dyn BlobStore>, decoder: Arc<dyn PrimaryDecoder>) -> Self {
        Self {
            pool,
            store,
            decoder,
        }
    }

    /// Decode every rotation, deduplicating raw codes across rotations (the
    /// same code read at 0° and 180° is one candidate).
    async fn decode_rotations(&self, image: &Image) -> Result<Vec<Candidate>, StageError> {
        let prep = &image.preprocessing.0;
        let normalized_path = prep
            .normalized_path
            .clone()
            .unwrap_or_else(|| BlobPaths::preprocessed(&image.batch_id, &image.image_id));

        let mut rotations: Vec<u16> = prep.rotations_generated.clone();
        if rotations.is_empty() {
            rotations.push(0);
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();

        for angle in rotations {
            let path = if angle == 0 {
                normalized_path.clone()
            } else {
                BlobPaths::rotation(&image.batch_id, &image.image_id, angle)
            };

            let bytes = self.store.download(&path).await?;
            let decoded = self.decoder.decode(&bytes).await?;

            for raw in decoded {
                if !seen.insert(raw.code.clone()) {
                    continue;
                }
                let (detected, flags) = barcode::classify(&raw.code);
                let symbology = raw.symbology.unwrap_or(detected);
                let normalized = barcode::normalize(&raw.code, symbology);
                candidates.push(Candidate {
                    raw: raw.code,
                    symbology,
                    normalized,
                    flags,
                    rotation: angle,
                });
            }
        }

        Ok(candidates)
    }
}

#[async_trait]
impl StageHandler for DecodePrimaryHandler {
    fn stage(&self) -> &'static str {
        "decode_primary"
    }

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError> {
        let Some(image) = image_queries::get_image(&self.pool, &job.image_id).await? else {
            return Err(StageError::InvalidInput(format!(
                "image {} not found",
                job.image_id
            )));
        };

        if !image_queries::begin_primary_decode(&self.pool, &image.image_id).await? {
            return Ok(StageOutcome::Skipped);
        }

        let started = Instant::now();
        let candidates = self.decode_rotations(&image).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Distinct accepted codes after normalization decide the route.
        let accepted: HashSet<String> = candidates
            .iter()
            .filter(|c| c.flags.accepted())
            .filter_map(|c| c.normalized.clone())
            .collect();
        let ambiguous = accepted.len() >= 2;

        let mut processing = image.processing.0.clone();
        processing.record_attempt(
            self.decoder.name(),
            false,
            accepted.len() == 1,
            accepted.len(),
            duration_ms,
        );

        let mut detections = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let (product_found, product_id) = product_lookup(&self.pool, &candidate.raw).await;
            let is_accepted = candidate.flags.accepted();
            detections.push(NewDetection {
                image_id: image.image_id.clone(),
                batch_id: image.batch_id.clone(),
                source_filename: Some(image.source_filename.clone()),
                code: candidate.raw.clone(),
                symbology: candidate.symbology,
                normalized_code: candidate.normalized.clone(),
                source: DetectionSource::PrimaryZbar,
                confidence: None,
                rotation_degrees: Some(i32::from(candidate.rotation)),
                checksum_valid: candidate.flags.checksum_valid,
                length_valid: candidate.flags.length_valid,
                numeric_only: candidate.flags.numeric_only,
                ambiguous: ambiguous && is_accepted,
                product_found,
                product_id,
                gemini_confidence: None,
                gemini_symbology_guess: None,
            });
        }
        detection_queries::insert_many(&self.pool, &detections).await?;

        let prep_path = image
            .preprocessing
            .0
            .normalized_path
            .clone()
            .unwrap_or_else(|| BlobPaths::preprocessed(&image.batch_id, &image.image_id));

        match accepted.len() {
            1 => {
                let final_path = BlobPaths::processed(&image.batch_id, &image.image_id);
                self.store.move_blob(&prep_path, &final_path).await?;

                if !image_queries::complete_decode(
                    &self.pool,
                    &image.image_id,
                    ImageStatus::DecodingPrimary,
                    ImageStatus::DecodedPrimary,
                    &final_path,
                    detections.len() as i32,
                    &processing,
                )
                .await?
                {
                    return Ok(StageOutcome::Skipped);
                }

                let code = accepted.iter().next().cloned().unwrap_or_default();
                tracing::info!(
                    image_id = %image.image_id,
                    code,
                    duration_ms,
                    "image decoded by primary decoder"
                );
                Ok(StageOutcome::Done(serde_json::json!({
                    "accepted": 1,
                    "detections": detections.len(),
                    "duration_ms": duration_ms,
                })))
            }
            0 => {
                // Not a failure: flag for the AI fallback.
                if !image_queries::mark_needs_fallback(&self.pool, &image.image_id, &processing)
                    .await?
                {
                    return Ok(StageOutcome::Skipped);
                }
                tracing::info!(
                    image_id = %image.image_id,
                    candidates = detections.len(),
                    "no accepted code, flagged for fallback"
                );
                Ok(StageOutcome::Done(serde_json::json!({
                    "accepted": 0,
                    "needs_fallback": true,
                    "detections": detections.len(),
                })))
            }
            n => {
                // Two or more distinct accepted codes: a human decides.
                let review_path = BlobPaths::manual_review(&image.batch_id, &image.image_id);
                self.store.move_blob(&prep_path, &review_path).await?;

                if !image_queries::complete_decode(
                    &self.pool,
                    &image.image_id,
                    ImageStatus::DecodingPrimary,
                    ImageStatus::ManualReview,
                    &review_path,
                    detections.len() as i32,
                    &processing,
                )
                .await?
                {
                    return Ok(StageOutcome::Skipped);
                }
                tracing::info!(
                    image_id = %image.image_id,
                    distinct_codes = n,
                    "ambiguous primary decode, routed to manual review"
                );
                Ok(StageOutcome::Done(serde_json::json!({
                    "accepted": n,
                    "ambiguous": true,
                })))
            }
        }
    }

    async fn fail_permanently(&self, job: &Job, error: &StageError) {
        // A broken artifact is no reason to fail the image outright; the
        // fallback decoder reads the same blob through different machinery.
        tracing::warn!(
            image_id = %job.image_id,
            error = %error,
            "primary decode failed permanently, flagging for fallback"
        );
        let processing = match image_queries::get_image(&self.pool, &job.image_id).await {
            Ok(Some(image)) => {
                let mut p = image.processing.0.clone();
                p.record_attempt(self.decoder.name(), false, false, 0, 0);
                p
            }
            _ => Default::default(),
        };
        if let Err(e) =
            image_queries::mark_needs_fallback(&self.pool, &job.image_id, &processing).await
        {
            tracing::error!(image_id = %job.image_id, error = %e, "failed to flag fallback");
        }
    }
}
