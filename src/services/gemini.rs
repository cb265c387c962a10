//! Gemini-based fallback barcode extraction.
//!
//! Sends the normalized image to the Gemini `generateContent` REST API with a
//! structured-output prompt and salvages a JSON array of candidates from the
//! response text. Used only when the primary decoder finds nothing.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const EXTRACTION_PROMPT: &str = r#"You are a vision model specialized in reading barcodes from images.

Analyze the product image and extract any visible linear barcodes and their numeric codes.

Target symbologies:
- EAN-13 (13 digits)
- EAN-8 (8 digits)
- UPC-A (12 digits)
- UPC-E (6-8 digits, compressed UPC)

Instructions:
1. Locate every barcode region, even rotated or at an angle, and read the digits printed with the bars.
2. Ignore packaging text, prices, dates, and numbers not attached to a barcode.
3. Only return codes whose length matches a target symbology and whose check digit verifies.
4. Estimate a confidence between 0.0 and 1.0; prefer returning nothing over guessing unclear digits.
5. Return each distinct barcode once, with the highest confidence.

Output: ONLY a JSON array, no extra text or markdown. Each element:
{"code": "1234567890123", "symbologyGuess": "EAN-13", "confidence": 0.95}
"symbologyGuess" must be one of "EAN-13", "EAN-8", "UPC-A", "UPC-E".
If no valid barcode is readable, return []."#;

/// One candidate returned by the fallback decoder.
#[derive(Debug, Clone)]
pub struct LlmCode {
    pub code: String,
    pub symbology_guess: String,
    pub confidence: f64,
}

/// Full fallback-decoder result, with token usage for cost accounting.
#[derive(Debug, Clone, Default)]
pub struct FallbackExtraction {
    pub codes: Vec<LlmCode>,
    pub tokens_used: Option<u64>,
}

/// Seam for the AI fallback decoder so tests can script responses.
#[async_trait]
pub trait FallbackDecoder: Send + Sync {
    async fn extract_codes(&self, image: &[u8]) -> Result<FallbackExtraction, LlmError>;
}

/// Client for the Gemini vision API.
pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl GeminiClient {
    pub fn new(
        api_key: &str,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(LlmError::Http)?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
            temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        )
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

#[derive(Deserialize)]
struct RawCandidate {
    code: Option<serde_json::Value>,
    #[serde(rename = "symbologyGuess", default)]
    symbology_guess: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[async_trait]
impl FallbackDecoder for GeminiClient {
    async fn extract_codes(&self, image: &[u8]) -> Result<FallbackExtraction, LlmError> {
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": EXTRACTION_PROMPT },
                    { "inline_data": {
                        "mime_type": "image/jpeg",
                        "data": base64::engine::general_purpose::STANDARD.encode(image),
                    }},
                ],
            }],
            "generationConfig": {
                "maxOutputTokens": self.max_tokens,
                "temperature": self.temperature,
            },
        });

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::Http)?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(LlmError::RateLimited);
            }
            status if !status.is_success() => {
                let detail = response.text().await.unwrap_or_default();
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    detail,
                });
            }
            _ => {}
        }

        let parsed: GenerateResponse = response.json().await.map_err(LlmError::Http)?;

        let text: String = parsed
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let codes = parse_candidates(&text).ok_or_else(|| LlmError::Unparseable {
            snippet: text.chars().take(200).collect(),
        })?;

        Ok(FallbackExtraction {
            codes,
            tokens_used: parsed.usage_metadata.and_then(|u| u.total_token_count),
        })
    }
}

/// Salvage a JSON array of candidates from model output, tolerating prose and
/// markdown fences around it.
fn parse_candidates(text: &str) -> Option<Vec<LlmCode>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let attempts = [
        text.to_string(),
        extract_delimited(text, '[', ']').unwrap_or_default(),
        extract_fenced(text).unwrap_or_default(),
        extract_delimited(text, '{', '}').unwrap_or_default(),
    ];

    for candidate in attempts.iter().filter(|s| !s.is_empty()) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
            let items = match value {
                serde_json::Value::Array(items) => items,
                obj @ serde_json::Value::Object(_) => vec![obj],
                _ => continue,
            };
            return Some(collect_codes(items));
        }
    }
    None
}

fn collect_codes(items: Vec<serde_json::Value>) -> Vec<LlmCode> {
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawCandidate>(item).ok())
        .filter_map(|raw| {
            let code = match raw.code? {
                serde_json::Value::String(s) => s.trim().to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            if code.is_empty() {
                return None;
            }
            Some(LlmCode {
                code,
                symbology_guess: raw.symbology_guess.unwrap_or_else(|| "UNKNOWN".to_string()),
                confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            })
        })
        .collect()
}

fn extract_delimited(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| text[start..=end].to_string())
}

fn extract_fenced(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let end = after.find("```")?;
    Some(after[..end].trim().to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited by the model API")]
    RateLimited,

    #[error("model API returned status {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("could not parse model response: {snippet}")]
    Unparseable { snippet: String },
}
