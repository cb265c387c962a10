use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::barcode::BarcodeSymbology;

/// How a barcode candidate was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "detection_source", rename_all = "snake_case")]
pub enum DetectionSource {
    PrimaryZbar,
    /// Reserved for a second local decoder; nothing produces it today.
    PrimaryZxing,
    FallbackGemini,
    Manual,
}

/// One extracted barcode candidate for an image.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Detection {
    pub id: Uuid,
    pub image_id: String,
    pub batch_id: String,
    pub source_filename: Option<String>,
    pub code: String,
    pub symbology: BarcodeSymbology,
    pub normalized_code: Option<String>,
    pub source: DetectionSource,
    pub confidence: Option<f64>,
    pub rotation_degrees: Option<i32>,
    pub checksum_valid: bool,
    pub length_valid: bool,
    pub numeric_only: bool,
    pub ambiguous: bool,
    pub chosen: bool,
    pub rejected: bool,
    pub product_found: bool,
    pub product_id: Option<String>,
    pub gemini_confidence: Option<f64>,
    pub gemini_symbology_guess: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
}

impl Detection {
    /// Passes every validation gate (the stage-handler success criterion).
    pub fn is_accepted(&self) -> bool {
        self.checksum_valid && self.length_valid && self.numeric_only
    }
}

/// Insert payload for a detection row.
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub image_id: String,
    pub batch_id: String,
    pub source_filename: Option<String>,
    pub code: String,
    pub symbology: BarcodeSymbology,
    pub normalized_code: Option<String>,
    pub source: DetectionSource,
    pub confidence: Option<f64>,
    pub rotation_degrees: Option<i32>,
    pub checksum_valid: bool,
    pub length_valid: bool,
    pub numeric_only: bool,
    pub ambiguous: bool,
    pub product_found: bool,
    pub product_id: Option<String>,
    pub gemini_confidence: Option<f64>,
    pub gemini_symbology_guess: Option<String>,
}
