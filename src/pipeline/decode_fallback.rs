//! Fallback decode stage: submit the normalized image to the AI decoder,
//! validate and persist what it returns, and route by the number of distinct
//! accepted codes. Also serves the failed-retry path: a `failed` image with
//! remaining attempt budget re-enters here.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::db::{detection_queries, image_queries};
use crate::models::{DetectionSource, Image, ImageStatus, Job, NewDetection};
use crate::pipeline::{product_lookup, StageError, StageHandler, StageOutcome, MAX_FALLBACK_ATTEMPTS};
use crate::services::barcode;
use crate::services::gemini::FallbackDecoder;
use crate::services::storage::{BlobPaths, BlobStore};

pub struct DecodeFallbackHandler {
    pool: PgPool,
    store: Arc<dyn BlobStore>,
    llm: Arc<dyn FallbackDecoder>,
}

impl DecodeFallbackHandler {
    pub fn new(pool: PgPool, store: Arc<dyn BlobStore>, llm: Arc<dyn FallbackDecoder>) -> Self {
        Self { pool, store, llm }
    }

    /// The artifact the fallback reads: the normalized image wherever the
    /// pipeline last left it.
    fn working_path(image: &Image) -> String {
        if image.status == ImageStatus::Failed {
            image
                .final_blob_path
                .clone()
                .unwrap_or_else(|| BlobPaths::failed(&image.batch_id, &image.image_id))
        } else {
            image
                .preprocessing
                .0
                .normalized_path
                .clone()
                .unwrap_or_else(|| BlobPaths::preprocessed(&image.batch_id, &image.image_id))
        }
    }
}

#[async_trait]
impl StageHandler for DecodeFallbackHandler {
    fn stage(&self) -> &'static str {
        "decode_fallback"
    }

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError> {
        let Some(image) = image_queries::get_image(&self.pool, &job.image_id).await? else {
            return Err(StageError::InvalidInput(format!(
                "image {} not found",
                job.image_id
            )));
        };

        // Remember where the artifact lives before the claim rewrites status.
        let mut source_path = Self::working_path(&image);
        let retrying_failed = image.status == ImageStatus::Failed;

        if !image_queries::begin_fallback_decode(&self.pool, &image.image_id, MAX_FALLBACK_ATTEMPTS)
            .await?
        {
            return Ok(StageOutcome::Skipped);
        }

        // A resumed attempt may find the artifact already parked in failed/.
        let bytes = match self.store.download(&source_path).await {
            Ok(bytes) => bytes,
            Err(first_err) => {
                let parked = BlobPaths::failed(&image.batch_id, &image.image_id);
                if parked == source_path {
                    return Err(first_err.into());
                }
                let bytes = self.store.download(&parked).await.map_err(|_| first_err)?;
                source_path = parked;
                bytes
            }
        };

        let started = Instant::now();
        let extraction = self.llm.extract_codes(&bytes).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Validate and dedupe what the model returned.
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();
        for llm_code in &extraction.codes {
            if !seen.insert(llm_code.code.clone()) {
                continue;
            }
            let (symbology, flags) = barcode::classify(&llm_code.code);
            let normalized = barcode::normalize(&llm_code.code, symbology);
            candidates.push((llm_code, symbology, normalized, flags));
        }

        let accepted: HashSet<String> = candidates
            .iter()
            .filter(|(_, _, _, flags)| flags.accepted())
            .filter_map(|(_, _, normalized, _)| normalized.clone())
            .collect();
        let ambiguous = accepted.len() >= 2;

        let mut processing = image.processing.0.clone();
        processing.record_attempt("gemini", true, accepted.len() == 1, accepted.len(), duration_ms);
        if let Some(tokens) = extraction.tokens_used {
            processing.add_tokens(tokens);
        }

        let mut detections = Vec::with_capacity(candidates.len());
        for (llm_code, symbology, normalized, flags) in &candidates {
            let (product_found, product_id) = product_lookup(&self.pool, &llm_code.code).await;
            detections.push(NewDetection {
                image_id: image.image_id.clone(),
                batch_id: image.batch_id.clone(),
                source_filename: Some(image.source_filename.clone()),
                code: llm_code.code.clone(),
                symbology: *symbology,
                normalized_code: normalized.clone(),
                source: DetectionSource::FallbackGemini,
                confidence: Some(llm_code.confidence),
                rotation_degrees: None,
                checksum_valid: flags.checksum_valid,
                length_valid: flags.length_valid,
                numeric_only: flags.numeric_only,
                ambiguous: ambiguous && flags.accepted(),
                product_found,
                product_id,
                gemini_confidence: Some(llm_code.confidence),
                gemini_symbology_guess: Some(llm_code.symbology_guess.clone()),
            });
        }
        detection_queries::insert_many(&self.pool, &detections).await?;

        // Every completed fallback invocation spends one attempt, whatever
        // the outcome.
        image_queries::record_processing(&self.pool, &image.image_id, &processing, true).await?;

        let attempt_number = image.fallback_attempt_count + 1;

        match accepted.len() {
            1 => {
                let final_path = BlobPaths::processed(&image.batch_id, &image.image_id);
                self.store.move_blob(&source_path, &final_path).await?;

                if !image_queries::complete_decode(
                    &self.pool,
                    &image.image_id,
                    ImageStatus::DecodingFallback,
                    ImageStatus::DecodedFallback,
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
                    attempt = attempt_number,
                    retried = retrying_failed,
                    tokens = extraction.tokens_used,
                    "image decoded by fallback"
                );
                Ok(StageOutcome::Done(serde_json::json!({
                    "accepted": 1,
                    "attempt": attempt_number,
                    "tokens_used": extraction.tokens_used,
                })))
            }
            0 => {
                // Validation-fail is not an error; the dispatcher re-enters
                // this stage while attempt budget remains.
                let failed_path = BlobPaths::failed(&image.batch_id, &image.image_id);
                if source_path != failed_path {
                    self.store.move_blob(&source_path, &failed_path).await?;
                }

                if !image_queries::complete_decode(
                    &self.pool,
                    &image.image_id,
                    ImageStatus::DecodingFallback,
                    ImageStatus::Failed,
                    &failed_path,
                    detections.len() as i32,
                    &processing,
                )
                .await?
                {
                    return Ok(StageOutcome::Skipped);
                }
                tracing::info!(
                    image_id = %image.image_id,
                    attempt = attempt_number,
                    "fallback found no accepted code, image failed"
                );
                Ok(StageOutcome::Done(serde_json::json!({
                    "accepted": 0,
                    "attempt": attempt_number,
                })))
            }
            n => {
                let review_path = BlobPaths::manual_review(&image.batch_id, &image.image_id);
                self.store.move_blob(&source_path, &review_path).await?;

                if !image_queries::complete_decode(
                    &self.pool,
                    &image.image_id,
                    ImageStatus::DecodingFallback,
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
                    "ambiguous fallback decode, routed to manual review"
                );
                Ok(StageOutcome::Done(serde_json::json!({
                    "accepted": n,
                    "ambiguous": true,
                })))
            }
        }
    }

    async fn fail_permanently(&self, job: &Job, error: &StageError) {
        tracing::warn!(
            image_id = %job.image_id,
            error = %error,
            "fallback decode failed permanently, marking image failed"
        );
        match image_queries::transition(
            &self.pool,
            &job.image_id,
            ImageStatus::DecodingFallback,
            ImageStatus::Failed,
        )
        .await
        {
            Ok(true) => {
                // Park the artifact in failed/ so a later retry can find it.
                if let Ok(Some(image)) = image_queries::get_image(&self.pool, &job.image_id).await {
                    let failed_path = BlobPaths::failed(&image.batch_id, &image.image_id);
                    let working = image
                        .preprocessing
                        .0
                        .normalized_path
                        .clone()
                        .unwrap_or_else(|| {
                            BlobPaths::preprocessed(&image.batch_id, &image.image_id)
                        });
                    if working != failed_path {
                        if let Err(e) = self.store.move_blob(&working, &failed_path).await {
                            tracing::warn!(error = %e, "could not park failed artifact");
                        } else if let Err(e) = image_queries::set_final_blob_path(
                            &self.pool,
                            &job.image_id,
                            &failed_path,
                        )
                        .await
                        {
                            tracing::warn!(error = %e, "could not record failed artifact path");
                        }
                    }
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(image_id = %job.image_id, error = %e, "failed to mark image failed");
            }
        }
    }
}
