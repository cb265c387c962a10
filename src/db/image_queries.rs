//! Image repository: creation, selectors for the dispatcher, and the
//! conditional (compare-and-set) status transitions every stage relies on.

use chrono::Utc;
use serde::Serialize;
use sqlx::{PgPool, Postgres};
use std::time::Duration;

use crate::models::{Image, ImageStatus, PreprocessingInfo, ProcessingInfo};

const IMAGE_COLUMNS: &str = "image_id, batch_id, source_path, source_filename, external_id, \
     status, status_updated_at, preprocessing, processing, needs_fallback, \
     fallback_attempt_count, final_blob_path, detection_count, content_type, file_size_bytes, \
     created_at, updated_at";

/// Insert payload for a new image (uploader).
#[derive(Debug, Clone)]
pub struct NewImage {
    pub image_id: String,
    pub batch_id: String,
    pub source_path: String,
    pub source_filename: String,
    pub external_id: Option<String>,
    pub content_type: String,
    pub file_size_bytes: Option<i64>,
}

pub async fn create_image(pool: &PgPool, new: &NewImage) -> Result<Image, sqlx::Error> {
    sqlx::query_as::<Postgres, Image>(&format!(
        r#"
        INSERT INTO images (image_id, batch_id, source_path, source_filename, external_id,
                            content_type, file_size_bytes)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {IMAGE_COLUMNS}
        "#,
    ))
    .bind(&new.image_id)
    .bind(&new.batch_id)
    .bind(&new.source_path)
    .bind(&new.source_filename)
    .bind(&new.external_id)
    .bind(&new.content_type)
    .bind(new.file_size_bytes)
    .fetch_one(pool)
    .await
}

pub async fn get_image(pool: &PgPool, image_id: &str) -> Result<Option<Image>, sqlx::Error> {
    sqlx::query_as::<Postgres, Image>(&format!(
        "SELECT {IMAGE_COLUMNS} FROM images WHERE image_id = $1"
    ))
    .bind(image_id)
    .fetch_optional(pool)
    .await
}

pub async fn find_by_status(
    pool: &PgPool,
    status: ImageStatus,
    limit: i64,
) -> Result<Vec<Image>, sqlx::Error> {
    sqlx::query_as::<Postgres, Image>(&format!(
        r#"
        SELECT {IMAGE_COLUMNS} FROM images
        WHERE status = $1
        ORDER BY created_at ASC
        LIMIT $2
        "#,
    ))
    .bind(status)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Preprocessed images waiting for the primary decoder.
pub async fn find_awaiting_primary(pool: &PgPool, limit: i64) -> Result<Vec<Image>, sqlx::Error> {
    sqlx::query_as::<Postgres, Image>(&format!(
        r#"
        SELECT {IMAGE_COLUMNS} FROM images
        WHERE status = 'preprocessed' AND NOT needs_fallback
        ORDER BY created_at ASC
        LIMIT $1
        "#,
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Preprocessed images the primary decoder gave up on.
pub async fn find_needing_fallback(pool: &PgPool, limit: i64) -> Result<Vec<Image>, sqlx::Error> {
    sqlx::query_as::<Postgres, Image>(&format!(
        r#"
        SELECT {IMAGE_COLUMNS} FROM images
        WHERE status = 'preprocessed' AND needs_fallback
        ORDER BY created_at ASC
        LIMIT $1
        "#,
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Failed images with fallback budget left whose last attempt is older than
/// `retry_delay`.
pub async fn find_failed_for_retry(
    pool: &PgPool,
    limit: i64,
    max_attempts: i32,
    retry_delay: Duration,
) -> Result<Vec<Image>, sqlx::Error> {
    sqlx::query_as::<Postgres, Image>(&format!(
        r#"
        SELECT {IMAGE_COLUMNS} FROM images
        WHERE status = 'failed'
          AND fallback_attempt_count > 0
          AND fallback_attempt_count < $2
          AND status_updated_at < NOW() - make_interval(secs => $3)
        ORDER BY status_updated_at ASC
        LIMIT $1
        "#,
    ))
    .bind(limit)
    .bind(max_attempts)
    .bind(retry_delay.as_secs_f64())
    .fetch_all(pool)
    .await
}

pub async fn find_for_review(
    pool: &PgPool,
    limit: i64,
    batch_id: Option<&str>,
) -> Result<Vec<Image>, sqlx::Error> {
    sqlx::query_as::<Postgres, Image>(&format!(
        r#"
        SELECT {IMAGE_COLUMNS} FROM images
        WHERE status = 'manual_review' AND ($2::text IS NULL OR batch_id = $2)
        ORDER BY status_updated_at ASC
        LIMIT $1
        "#,
    ))
    .bind(limit)
    .bind(batch_id)
    .fetch_all(pool)
    .await
}

/// Conditional status transition. Returns false when the image was not in
/// `from` anymore — the caller lost the race and must treat its work as
/// superseded.
pub async fn transition(
    pool: &PgPool,
    image_id: &str,
    from: ImageStatus,
    to: ImageStatus,
) -> Result<bool, sqlx::Error> {
    debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");

    let result = sqlx::query(
        r#"
        UPDATE images
        SET status = $3, status_updated_at = NOW(), updated_at = NOW()
        WHERE image_id = $1 AND status = $2
        "#,
    )
    .bind(image_id)
    .bind(from)
    .bind(to)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Claim an image for preprocessing. Also matches `preprocessing` so a
/// retried job can resume after a crash mid-stage.
pub async fn begin_preprocess(pool: &PgPool, image_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE images
        SET status = 'preprocessing', status_updated_at = NOW(), updated_at = NOW()
        WHERE image_id = $1 AND status IN ('pending', 'preprocessing')
        "#,
    )
    .bind(image_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Claim an image for primary decoding (never one already flagged for
/// fallback).
pub async fn begin_primary_decode(pool: &PgPool, image_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE images
        SET status = 'decoding_primary', status_updated_at = NOW(), updated_at = NOW()
        WHERE image_id = $1
          AND ((status = 'preprocessed' AND NOT needs_fallback) OR status = 'decoding_primary')
        "#,
    )
    .bind(image_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Claim an image for fallback decoding, from either the flagged
/// `preprocessed` state or a retryable `failed` state.
pub async fn begin_fallback_decode(
    pool: &PgPool,
    image_id: &str,
    max_attempts: i32,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE images
        SET status = 'decoding_fallback', status_updated_at = NOW(), updated_at = NOW()
        WHERE image_id = $1
          AND ((status = 'preprocessed' AND needs_fallback)
               OR (status = 'failed' AND fallback_attempt_count < $2)
               OR status = 'decoding_fallback')
        "#,
    )
    .bind(image_id)
    .bind(max_attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Commit preprocessing output and advance to `preprocessed`.
pub async fn complete_preprocess(
    pool: &PgPool,
    image_id: &str,
    prep: &PreprocessingInfo,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE images
        SET status = 'preprocessed',
            status_updated_at = NOW(),
            preprocessing = $2,
            updated_at = NOW()
        WHERE image_id = $1 AND status = 'preprocessing'
        "#,
    )
    .bind(image_id)
    .bind(sqlx::types::Json(prep))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Primary decoding found nothing acceptable: return to `preprocessed` with
/// the fallback flag raised. Not a failure.
pub async fn mark_needs_fallback(
    pool: &PgPool,
    image_id: &str,
    processing: &ProcessingInfo,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE images
        SET status = 'preprocessed',
            status_updated_at = NOW(),
            needs_fallback = TRUE,
            processing = $2,
            updated_at = NOW()
        WHERE image_id = $1 AND status = 'decoding_primary'
        "#,
    )
    .bind(image_id)
    .bind(sqlx::types::Json(processing))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Persist the attempt history mid-stage (the caller holds the in-flight
/// status, so no CAS guard is needed). `bump_fallback` counts one fallback
/// attempt against the image's retry budget.
pub async fn record_processing(
    pool: &PgPool,
    image_id: &str,
    processing: &ProcessingInfo,
    bump_fallback: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE images
        SET processing = $2,
            fallback_attempt_count = fallback_attempt_count + $3,
            updated_at = NOW()
        WHERE image_id = $1
        "#,
    )
    .bind(image_id)
    .bind(sqlx::types::Json(processing))
    .bind(if bump_fallback { 1i32 } else { 0i32 })
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal (or review) transition out of a decode stage, recording the
/// final blob location and detection count.
pub async fn complete_decode(
    pool: &PgPool,
    image_id: &str,
    from: ImageStatus,
    to: ImageStatus,
    final_blob_path: &str,
    detection_count: i32,
    processing: &ProcessingInfo,
) -> Result<bool, sqlx::Error> {
    debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");

    let result = sqlx::query(
        r#"
        UPDATE images
        SET status = $3,
            status_updated_at = NOW(),
            final_blob_path = $4,
            detection_count = $5,
            processing = $6,
            updated_at = NOW()
        WHERE image_id = $1 AND status = $2
        "#,
    )
    .bind(image_id)
    .bind(from)
    .bind(to)
    .bind(final_blob_path)
    .bind(detection_count)
    .bind(sqlx::types::Json(processing))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_final_blob_path(
    pool: &PgPool,
    image_id: &str,
    path: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE images SET final_blob_path = $2, updated_at = NOW() WHERE image_id = $1",
    )
    .bind(image_id)
    .bind(path)
    .execute(pool)
    .await?;
    Ok(())
}

/// Append an error record to the image's processing history.
pub async fn add_processing_error(
    pool: &PgPool,
    image_id: &str,
    stage: &str,
    message: &str,
    details: Option<serde_json::Value>,
) -> Result<(), sqlx::Error> {
    let entry = serde_json::json!([{
        "stage": stage,
        "message": message,
        "timestamp": Utc::now(),
        "details": details,
    }]);

    sqlx::query(
        r#"
        UPDATE images
        SET processing = jsonb_set(
                processing,
                '{errors}',
                COALESCE(processing->'errors', '[]'::jsonb) || $2::jsonb
            ),
            updated_at = NOW()
        WHERE image_id = $1
        "#,
    )
    .bind(image_id)
    .bind(entry)
    .execute(pool)
    .await?;
    Ok(())
}

/// Status histogram plus the documented success rate (decoded over all
/// images, terminal and in-flight alike).
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub total_images: i64,
    pub pending: i64,
    pub preprocessing: i64,
    pub preprocessed: i64,
    pub decoding_primary: i64,
    pub decoded_primary: i64,
    pub decoding_fallback: i64,
    pub decoded_fallback: i64,
    pub manual_review: i64,
    pub decoded_manual: i64,
    pub failed: i64,
    pub success_rate: f64,
}

pub async fn pipeline_stats(
    pool: &PgPool,
    batch_id: Option<&str>,
) -> Result<PipelineStats, sqlx::Error> {
    use sqlx::Row;

    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE status = 'pending') AS pending,
            COUNT(*) FILTER (WHERE status = 'preprocessing') AS preprocessing,
            COUNT(*) FILTER (WHERE status = 'preprocessed') AS preprocessed,
            COUNT(*) FILTER (WHERE status = 'decoding_primary') AS decoding_primary,
            COUNT(*) FILTER (WHERE status = 'decoded_primary') AS decoded_primary,
            COUNT(*) FILTER (WHERE status = 'decoding_fallback') AS decoding_fallback,
            COUNT(*) FILTER (WHERE status = 'decoded_fallback') AS decoded_fallback,
            COUNT(*) FILTER (WHERE status = 'manual_review') AS manual_review,
            COUNT(*) FILTER (WHERE status = 'decoded_manual') AS decoded_manual,
            COUNT(*) FILTER (WHERE status = 'failed') AS failed
        FROM images
        WHERE $1::text IS NULL OR batch_id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;

    let get = |name: &str| row.get::<Option<i64>, _>(name).unwrap_or(0);

    let mut stats = PipelineStats {
        total_images: get("total"),
        pending: get("pending"),
        preprocessing: get("preprocessing"),
        preprocessed: get("preprocessed"),
        decoding_primary: get("decoding_primary"),
        decoded_primary: get("decoded_primary"),
        decoding_fallback: get("decoding_fallback"),
        decoded_fallback: get("decoded_fallback"),
        manual_review: get("manual_review"),
        decoded_manual: get("decoded_manual"),
        failed: get("failed"),
        success_rate: 0.0,
    };

    if stats.total_images > 0 {
        let decoded = stats.decoded_primary + stats.decoded_fallback + stats.decoded_manual;
        stats.success_rate =
            (decoded as f64 / stats.total_images as f64 * 10_000.0).round() / 100.0;
    }

    Ok(stats)
}
