//! Image endpoints: batch upload (the uploader role), review listing and
//! detail, and manual resolution.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::{detection_queries, image_queries};
use crate::models::{Detection, Image};
use crate::pipeline::resolve::{self, ResolveAction, ResolveError, ResolveOutcome};
use crate::services::storage::BlobPaths;

const MAX_IMAGE_SIZE: usize = 20 * 1024 * 1024; // 20MB
const MIN_IMAGE_SIZE: usize = 128;

#[derive(Serialize)]
pub struct UploadResponse {
    pub image_id: String,
    pub batch_id: String,
    pub status: String,
}

/// POST /api/batches/:batch_id/images — upload a product image into a batch.
/// The image lands in `incoming/` and enters the pipeline as `pending`.
pub async fn upload_image(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    let mut image_data: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut external_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        match field.name() {
            Some("image") => {
                if let Some(name) = field.file_name() {
                    filename = Some(name.to_string());
                }
                let data = field.bytes().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read image: {}", e))
                })?;

                if data.len() < MIN_IMAGE_SIZE {
                    return Err((StatusCode::BAD_REQUEST, "Image too small".to_string()));
                }
                if data.len() > MAX_IMAGE_SIZE {
                    return Err((
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "Image too large (maximum 20MB)".to_string(),
                    ));
                }
                if image::guess_format(&data).is_err() {
                    return Err((
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        "Invalid or unrecognized image format".to_string(),
                    ));
                }

                image_data = Some(data.to_vec());
            }
            Some("external_id") => {
                let text = field.text().await.map_err(|_| {
                    (StatusCode::BAD_REQUEST, "Invalid external_id field".to_string())
                })?;
                external_id = Some(text);
            }
            _ => {}
        }
    }

    let image_data = image_data.ok_or((
        StatusCode::BAD_REQUEST,
        "Missing 'image' field in multipart upload".to_string(),
    ))?;

    let image_id = Uuid::new_v4().to_string();
    let source_filename = filename.unwrap_or_else(|| format!("{image_id}.jpg"));
    let source_path = BlobPaths::incoming(&batch_id, &source_filename);

    state
        .store
        .upload(&source_path, &image_data, "image/jpeg")
        .await
        .map_err(|e| {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Storage upload failed: {}", e))
        })?;

    let new_image = image_queries::NewImage {
        image_id: image_id.clone(),
        batch_id: batch_id.clone(),
        source_path,
        source_filename,
        external_id,
        content_type: "image/jpeg".to_string(),
        file_size_bytes: Some(image_data.len() as i64),
    };

    let image = image_queries::create_image(&state.db, &new_image)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e)))?;

    tracing::info!(
        image_id = %image.image_id,
        batch_id = %image.batch_id,
        size = image_data.len(),
        "image uploaded"
    );

    Ok(Json(UploadResponse {
        image_id: image.image_id,
        batch_id: image.batch_id,
        status: image.status.to_string(),
    }))
}

#[derive(Deserialize)]
pub struct ReviewQuery {
    #[serde(default = "default_review_limit")]
    pub limit: i64,
    pub batch_id: Option<String>,
}

fn default_review_limit() -> i64 {
    50
}

#[derive(Serialize)]
pub struct ImageSummary {
    pub image_id: String,
    pub batch_id: String,
    pub external_id: Option<String>,
    pub status: String,
    pub detection_count: i32,
    pub created_at: DateTime<Utc>,
}

impl From<Image> for ImageSummary {
    fn from(img: Image) -> Self {
        Self {
            image_id: img.image_id,
            batch_id: img.batch_id,
            external_id: img.external_id,
            status: img.status.to_string(),
            detection_count: img.detection_count,
            created_at: img.created_at,
        }
    }
}

/// GET /api/images/review — images awaiting manual review.
pub async fn list_review_images(
    State(state): State<AppState>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<Vec<ImageSummary>>, (StatusCode, String)> {
    let limit = query.limit.clamp(1, 100);
    let images = image_queries::find_for_review(&state.db, limit, query.batch_id.as_deref())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e)))?;

    Ok(Json(images.into_iter().map(ImageSummary::from).collect()))
}

#[derive(Serialize)]
pub struct ImageDetail {
    #[serde(flatten)]
    pub image: Image,
    pub detections: Vec<Detection>,
}

/// GET /api/images/:image_id — full image record with detections.
pub async fn get_image_detail(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Json<ImageDetail>, (StatusCode, String)> {
    let image = image_queries::get_image(&state.db, &image_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e)))?
        .ok_or((StatusCode::NOT_FOUND, "Image not found".to_string()))?;

    let detections = detection_queries::find_by_image(&state.db, &image_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e)))?;

    Ok(Json(ImageDetail { image, detections }))
}

#[derive(Deserialize)]
pub struct ReviewDecision {
    pub action: ResolveAction,
    pub detection_id: Option<Uuid>,
    pub reviewer: Option<String>,
}

#[derive(Serialize)]
pub struct ResolveResponse {
    pub status: String,
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
}

/// POST /api/images/:image_id/resolve — submit a review decision.
pub async fn resolve_image(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    Json(decision): Json<ReviewDecision>,
) -> Result<Json<ResolveResponse>, (StatusCode, String)> {
    let outcome = resolve::resolve_image(
        &state.db,
        &state.store,
        &image_id,
        decision.action,
        decision.detection_id,
        decision.reviewer.as_deref(),
    )
    .await
    .map_err(|e| match e {
        ResolveError::ImageNotFound => (StatusCode::NOT_FOUND, e.to_string()),
        ResolveError::NotInReview
        | ResolveError::MissingDetectionId
        | ResolveError::UnknownDetection => (StatusCode::BAD_REQUEST, e.to_string()),
        ResolveError::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    })?;

    let response = match outcome {
        ResolveOutcome::Skipped => ResolveResponse {
            status: "skipped".to_string(),
            image_id,
            new_status: None,
        },
        ResolveOutcome::Resolved(new_status) => ResolveResponse {
            status: "resolved".to_string(),
            image_id,
            new_status: Some(new_status.to_string()),
        },
    };

    Ok(Json(response))
}
