//! Shared test doubles and fixtures for the pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use ean_extract::db::image_queries::{self, NewImage};
use ean_extract::models::Image;
use ean_extract::services::gemini::{FallbackDecoder, FallbackExtraction, LlmCode, LlmError};
use ean_extract::services::storage::{BlobPaths, BlobStore, StorageError};
use ean_extract::services::zbar::{DecodeError, PrimaryDecoder, RawDecode};

/// Connect to the test database (TEST_DATABASE_URL or DATABASE_URL) and
/// apply migrations. Active jobs left behind by earlier aborted runs are
/// purged (tests enqueue at priority >= 1000) so leases stay predictable.
pub async fn test_pool() -> PgPool {
    let url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .expect("TEST_DATABASE_URL or DATABASE_URL must be set for integration tests");
    let pool = ean_extract::db::init_pool(&url).await.expect("connect test db");
    ean_extract::db::run_migrations(&pool).await.expect("migrate test db");

    sqlx::query("DELETE FROM jobs WHERE status IN ('pending', 'in_progress') AND priority >= 1000")
        .execute(&pool)
        .await
        .expect("purge stale test jobs");

    pool
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(path)
    }

    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.blobs.lock().unwrap().insert(path.to_string(), data);
    }

    pub fn paths(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::Config(format!("no blob at {path}")))
    }

    async fn upload(
        &self,
        path: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.blobs.lock().unwrap().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.blobs.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Primary decoder returning the same raw codes for every rotation.
pub struct ScriptedPrimaryDecoder {
    codes: Vec<String>,
}

impl ScriptedPrimaryDecoder {
    pub fn returning(codes: &[&str]) -> Self {
        Self {
            codes: codes.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn empty() -> Self {
        Self { codes: Vec::new() }
    }
}

#[async_trait]
impl PrimaryDecoder for ScriptedPrimaryDecoder {
    fn name(&self) -> &'static str {
        "zbar"
    }

    async fn decode(&self, _image: &[u8]) -> Result<Vec<RawDecode>, DecodeError> {
        Ok(self
            .codes
            .iter()
            .map(|code| RawDecode {
                code: code.clone(),
                symbology: None,
            })
            .collect())
    }
}

/// Fallback decoder replaying a queue of responses, then empty extractions.
pub struct ScriptedFallbackDecoder {
    responses: Mutex<VecDeque<FallbackExtraction>>,
}

impl ScriptedFallbackDecoder {
    pub fn replaying(responses: Vec<FallbackExtraction>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn returning_codes(codes: &[(&str, f64)]) -> Self {
        Self::replaying(vec![extraction(codes)])
    }

    pub fn empty() -> Self {
        Self::replaying(Vec::new())
    }
}

pub fn extraction(codes: &[(&str, f64)]) -> FallbackExtraction {
    FallbackExtraction {
        codes: codes
            .iter()
            .map(|(code, confidence)| LlmCode {
                code: code.to_string(),
                symbology_guess: "EAN-13".to_string(),
                confidence: *confidence,
            })
            .collect(),
        tokens_used: Some(100),
    }
}

#[async_trait]
impl FallbackDecoder for ScriptedFallbackDecoder {
    async fn extract_codes(&self, _image: &[u8]) -> Result<FallbackExtraction, LlmError> {
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

/// A small valid JPEG (uniform gray square) for blob fixtures.
pub fn sample_jpeg() -> Vec<u8> {
    use image::codecs::jpeg::JpegEncoder;
    use image::{GrayImage, Luma};
    use std::io::Cursor;

    let img = GrayImage::from_pixel(64, 64, Luma([128u8]));
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 90);
    img.write_with_encoder(encoder).expect("encode sample jpeg");
    buf.into_inner()
}

/// Create a pending image with its source blob in `incoming/`.
pub async fn seed_pending_image(
    pool: &PgPool,
    store: &Arc<MemoryBlobStore>,
    batch_id: &str,
    filename: &str,
) -> Image {
    let image_id = Uuid::new_v4().to_string();
    let source_path = BlobPaths::incoming(batch_id, filename);
    store.insert(&source_path, sample_jpeg());

    image_queries::create_image(
        pool,
        &NewImage {
            image_id,
            batch_id: batch_id.to_string(),
            source_path,
            source_filename: filename.to_string(),
            external_id: None,
            content_type: "image/jpeg".to_string(),
            file_size_bytes: None,
        },
    )
    .await
    .expect("seed image")
}

/// Force an image straight into `preprocessed` with its normalized artifact
/// in place, bypassing the preprocess stage.
pub async fn seed_preprocessed_image(
    pool: &PgPool,
    store: &Arc<MemoryBlobStore>,
    batch_id: &str,
    filename: &str,
) -> Image {
    let image = seed_pending_image(pool, store, batch_id, filename).await;

    let normalized_path = BlobPaths::preprocessed(batch_id, &image.image_id);
    store.insert(&normalized_path, sample_jpeg());

    assert!(image_queries::begin_preprocess(pool, &image.image_id).await.unwrap());
    let prep = ean_extract::models::PreprocessingInfo {
        normalized_path: Some(normalized_path),
        original_width: Some(64),
        original_height: Some(64),
        processed_width: Some(64),
        processed_height: Some(64),
        grayscale: true,
        clahe_applied: false,
        denoised: false,
        rotations_generated: vec![0],
        duration_ms: Some(1),
        completed_at: Some(chrono::Utc::now()),
    };
    assert!(image_queries::complete_preprocess(pool, &image.image_id, &prep).await.unwrap());

    image_queries::get_image(pool, &image.image_id)
        .await
        .unwrap()
        .unwrap()
}

/// Fresh batch id per test so parallel tests never interfere.
pub fn unique_batch() -> String {
    format!("test-{}", Uuid::new_v4().simple())
}

/// Age an image's last status change so retry-delay selectors see it.
pub async fn age_status(pool: &PgPool, image_id: &str, seconds: i64) {
    sqlx::query(
        "UPDATE images SET status_updated_at = status_updated_at - make_interval(secs => $2) \
         WHERE image_id = $1",
    )
    .bind(image_id)
    .bind(seconds as f64)
    .execute(pool)
    .await
    .expect("age image status");
}

/// Expire a job's lease so reap picks it up.
pub async fn expire_lease(pool: &PgPool, job_id: Uuid) {
    sqlx::query(
        "UPDATE jobs SET lock_until = NOW() - interval '1 second' WHERE job_id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .expect("expire job lease");
}
