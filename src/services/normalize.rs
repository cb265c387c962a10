//! Image normalization for barcode detection: grayscale, bounded resize,
//! optional denoise, and rotation variants.

use image::imageops::{self, FilterType};
use image::codecs::jpeg::JpegEncoder;
use image::GrayImage;
use std::io::Cursor;
use std::time::Instant;

const JPEG_QUALITY: u8 = 90;

/// Normalization parameters. The rotation set must include 0°.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub max_dimension: u32,
    pub denoise_strength: u32,
    pub rotations: Vec<u16>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_dimension: 2048,
            denoise_strength: 10,
            rotations: vec![0, 90, 180, 270],
        }
    }
}

/// A rotation variant of the normalized image.
#[derive(Debug, Clone)]
pub struct RotatedVariant {
    pub angle: u16,
    pub bytes: Vec<u8>,
}

/// Output of normalization. `bytes` is the 0° normalized JPEG; `rotations`
/// holds the non-zero variants.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub rotations: Vec<RotatedVariant>,
    pub original_width: u32,
    pub original_height: u32,
    pub processed_width: u32,
    pub processed_height: u32,
    pub grayscale: bool,
    pub denoised: bool,
    pub clahe_applied: bool,
    pub duration_ms: u64,
}

/// Pixel-level normalization seam; CPU-bound, invoked through
/// `spawn_blocking` by the preprocess handler.
pub trait ImageNormalizer: Send + Sync {
    fn normalize(
        &self,
        data: &[u8],
        options: &NormalizeOptions,
    ) -> Result<NormalizedImage, NormalizeError>;
}

/// Normalizer built on the `image` crate.
pub struct Normalizer;

impl ImageNormalizer for Normalizer {
    fn normalize(
        &self,
        data: &[u8],
        options: &NormalizeOptions,
    ) -> Result<NormalizedImage, NormalizeError> {
        if data.is_empty() {
            return Err(NormalizeError::EmptyInput);
        }
        let start = Instant::now();

        let decoded = image::load_from_memory(data)
            .map_err(|e| NormalizeError::InvalidImage(e.to_string()))?;
        let (original_width, original_height) = (decoded.width(), decoded.height());

        let mut gray: GrayImage = decoded.to_luma8();

        if original_width.max(original_height) > options.max_dimension {
            let scale = options.max_dimension as f64 / original_width.max(original_height) as f64;
            let new_width = (original_width as f64 * scale).round().max(1.0) as u32;
            let new_height = (original_height as f64 * scale).round().max(1.0) as u32;
            gray = imageops::resize(&gray, new_width, new_height, FilterType::CatmullRom);
        }

        let denoised = options.denoise_strength > 0;
        if denoised {
            let sigma = options.denoise_strength as f32 / 10.0;
            gray = imageops::blur(&gray, sigma);
        }

        let (processed_width, processed_height) = gray.dimensions();

        let mut rotations = Vec::new();
        for &angle in &options.rotations {
            if angle == 0 {
                continue;
            }
            let rotated = match angle {
                90 => imageops::rotate90(&gray),
                180 => imageops::rotate180(&gray),
                270 => imageops::rotate270(&gray),
                other => return Err(NormalizeError::UnsupportedRotation(other)),
            };
            rotations.push(RotatedVariant {
                angle,
                bytes: encode_jpeg(&rotated)?,
            });
        }

        Ok(NormalizedImage {
            bytes: encode_jpeg(&gray)?,
            rotations,
            original_width,
            original_height,
            processed_width,
            processed_height,
            grayscale: true,
            denoised,
            clahe_applied: false,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn encode_jpeg(img: &GrayImage) -> Result<Vec<u8>, NormalizeError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    img.write_with_encoder(encoder)
        .map_err(|e| NormalizeError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("empty image input")]
    EmptyInput,

    #[error("could not decode image: {0}")]
    InvalidImage(String),

    #[error("unsupported rotation angle: {0}")]
    UnsupportedRotation(u16),

    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}
