//! Detection repository. Rows are written by the decode stages and only ever
//! mutated by manual review.

use chrono::Utc;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::models::{Detection, NewDetection};

const DETECTION_COLUMNS: &str = "id, image_id, batch_id, source_filename, code, symbology, \
     normalized_code, source, confidence, rotation_degrees, checksum_valid, length_valid, \
     numeric_only, ambiguous, chosen, rejected, product_found, product_id, gemini_confidence, \
     gemini_symbology_guess, detected_at, reviewed_at, reviewed_by";

pub async fn insert(pool: &PgPool, new: &NewDetection) -> Result<Detection, sqlx::Error> {
    sqlx::query_as::<Postgres, Detection>(&format!(
        r#"
        INSERT INTO detections (image_id, batch_id, source_filename, code, symbology,
                                normalized_code, source, confidence, rotation_degrees,
                                checksum_valid, length_valid, numeric_only, ambiguous,
                                product_found, product_id, gemini_confidence,
                                gemini_symbology_guess)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        RETURNING {DETECTION_COLUMNS}
        "#,
    ))
    .bind(&new.image_id)
    .bind(&new.batch_id)
    .bind(&new.source_filename)
    .bind(&new.code)
    .bind(new.symbology)
    .bind(&new.normalized_code)
    .bind(new.source)
    .bind(new.confidence)
    .bind(new.rotation_degrees)
    .bind(new.checksum_valid)
    .bind(new.length_valid)
    .bind(new.numeric_only)
    .bind(new.ambiguous)
    .bind(new.product_found)
    .bind(&new.product_id)
    .bind(new.gemini_confidence)
    .bind(&new.gemini_symbology_guess)
    .fetch_one(pool)
    .await
}

pub async fn insert_many(
    pool: &PgPool,
    detections: &[NewDetection],
) -> Result<Vec<Detection>, sqlx::Error> {
    let mut inserted = Vec::with_capacity(detections.len());
    for detection in detections {
        inserted.push(insert(pool, detection).await?);
    }
    Ok(inserted)
}

pub async fn find_by_image(pool: &PgPool, image_id: &str) -> Result<Vec<Detection>, sqlx::Error> {
    sqlx::query_as::<Postgres, Detection>(&format!(
        r#"
        SELECT {DETECTION_COLUMNS} FROM detections
        WHERE image_id = $1
        ORDER BY detected_at ASC
        "#,
    ))
    .bind(image_id)
    .fetch_all(pool)
    .await
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Detection>, sqlx::Error> {
    sqlx::query_as::<Postgres, Detection>(&format!(
        "SELECT {DETECTION_COLUMNS} FROM detections WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn exists_for_image(pool: &PgPool, image_id: &str) -> Result<bool, sqlx::Error> {
    let exists: bool = sqlx::query_scalar::<Postgres, bool>(
        "SELECT EXISTS (SELECT 1 FROM detections WHERE image_id = $1)",
    )
    .bind(image_id)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Mark one detection as the reviewer's choice. Scoped to the image so a
/// stale detection id from another image cannot be chosen.
pub async fn mark_chosen(
    pool: &PgPool,
    id: Uuid,
    image_id: &str,
    reviewer: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE detections
        SET chosen = TRUE,
            rejected = FALSE,
            ambiguous = FALSE,
            reviewed_at = $3,
            reviewed_by = $4
        WHERE id = $1 AND image_id = $2
        "#,
    )
    .bind(id)
    .bind(image_id)
    .bind(Utc::now())
    .bind(reviewer)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Reject every detection of an image except the chosen one.
pub async fn reject_others(
    pool: &PgPool,
    image_id: &str,
    chosen_id: Uuid,
    reviewer: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE detections
        SET rejected = TRUE, chosen = FALSE, reviewed_at = $3, reviewed_by = $4
        WHERE image_id = $1 AND id <> $2
        "#,
    )
    .bind(image_id)
    .bind(chosen_id)
    .bind(Utc::now())
    .bind(reviewer)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn reject_all(
    pool: &PgPool,
    image_id: &str,
    reviewer: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE detections
        SET rejected = TRUE, chosen = FALSE, reviewed_at = $2, reviewed_by = $3
        WHERE image_id = $1
        "#,
    )
    .bind(image_id)
    .bind(Utc::now())
    .bind(reviewer)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
