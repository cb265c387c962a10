use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use strum::{Display, EnumString};

/// Status of an image in the processing pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[sqlx(type_name = "image_status", rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Preprocessing,
    Preprocessed,
    DecodingPrimary,
    DecodedPrimary,
    DecodingFallback,
    DecodedFallback,
    ManualReview,
    DecodedManual,
    Failed,
}

impl ImageStatus {
    /// Whether `self -> next` is a permitted pipeline transition.
    ///
    /// `Preprocessed -> DecodingFallback` additionally requires the fallback
    /// flag, and `Failed -> DecodingFallback` the attempt budget; those guards
    /// live in the conditional updates that apply the transition.
    pub fn can_transition_to(self, next: ImageStatus) -> bool {
        use ImageStatus::*;
        matches!(
            (self, next),
            (Pending, Preprocessing)
                | (Preprocessing, Preprocessed)
                | (Preprocessing, Failed)
                | (Preprocessed, DecodingPrimary)
                | (Preprocessed, DecodingFallback)
                | (DecodingPrimary, DecodedPrimary)
                | (DecodingPrimary, Preprocessed)
                | (DecodingPrimary, ManualReview)
                | (DecodingFallback, DecodedFallback)
                | (DecodingFallback, ManualReview)
                | (DecodingFallback, Failed)
                | (Failed, DecodingFallback)
                | (ManualReview, DecodedManual)
                | (ManualReview, Failed)
        )
    }

    /// Terminal statuses never leave via the pipeline (manual retry aside).
    pub fn is_terminal(self) -> bool {
        use ImageStatus::*;
        matches!(self, DecodedPrimary | DecodedFallback | DecodedManual)
    }
}

/// Record of what normalization produced for an image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessingInfo {
    pub normalized_path: Option<String>,
    pub original_width: Option<u32>,
    pub original_height: Option<u32>,
    pub processed_width: Option<u32>,
    pub processed_height: Option<u32>,
    #[serde(default)]
    pub grayscale: bool,
    #[serde(default)]
    pub clahe_applied: bool,
    #[serde(default)]
    pub denoised: bool,
    #[serde(default)]
    pub rotations_generated: Vec<u16>,
    pub duration_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Error recorded against an image during processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingError {
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// One decoder invocation against an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderAttempt {
    pub decoder: String,
    pub attempt_number: usize,
    pub success: bool,
    #[serde(default)]
    pub codes_found: usize,
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decode history and bookkeeping for an image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingInfo {
    #[serde(default)]
    pub primary_attempts: Vec<DecoderAttempt>,
    #[serde(default)]
    pub fallback_attempts: Vec<DecoderAttempt>,
    pub gemini_tokens_used: Option<u64>,
    #[serde(default)]
    pub errors: Vec<ProcessingError>,
}

impl ProcessingInfo {
    pub fn record_attempt(
        &mut self,
        decoder: &str,
        is_fallback: bool,
        success: bool,
        codes_found: usize,
        duration_ms: u64,
    ) {
        let attempts = if is_fallback {
            &mut self.fallback_attempts
        } else {
            &mut self.primary_attempts
        };
        let attempt_number = attempts.len() + 1;
        attempts.push(DecoderAttempt {
            decoder: decoder.to_string(),
            attempt_number,
            success,
            codes_found,
            duration_ms: Some(duration_ms),
            timestamp: Utc::now(),
            error: None,
        });
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.gemini_tokens_used = Some(self.gemini_tokens_used.unwrap_or(0) + tokens);
    }
}

/// An image traversing the pipeline.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Image {
    pub image_id: String,
    pub batch_id: String,
    pub source_path: String,
    pub source_filename: String,
    pub external_id: Option<String>,
    pub status: ImageStatus,
    pub status_updated_at: DateTime<Utc>,
    pub preprocessing: Json<PreprocessingInfo>,
    pub processing: Json<ProcessingInfo>,
    pub needs_fallback: bool,
    pub fallback_attempt_count: i32,
    pub final_blob_path: Option<String>,
    pub detection_count: i32,
    pub content_type: String,
    pub file_size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
