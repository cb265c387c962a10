use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address. Unused by worker/dispatcher processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string (metadata store)
    pub database_url: String,

    /// Object storage bucket holding all pipeline blobs
    #[serde(default = "default_storage_bucket")]
    pub storage_bucket: String,

    /// S3-compatible endpoint URL
    pub storage_endpoint: String,

    #[serde(default = "default_storage_region")]
    pub storage_region: String,

    pub storage_access_key: String,

    pub storage_secret_key: String,

    /// Gemini API key for the fallback decoder
    pub gemini_api_key: String,

    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    #[serde(default = "default_gemini_max_tokens")]
    pub gemini_max_tokens: u32,

    #[serde(default = "default_gemini_temperature")]
    pub gemini_temperature: f32,

    /// Gemini request timeout in seconds
    #[serde(default = "default_gemini_timeout")]
    pub gemini_timeout: u64,

    /// Seconds between job polls
    #[serde(default = "default_worker_poll_interval")]
    pub worker_poll_interval: u64,

    /// Max jobs per worker batch (and dispatcher seed bound)
    #[serde(default = "default_worker_batch_size")]
    pub worker_batch_size: usize,

    #[serde(default = "default_worker_max_retries")]
    pub worker_max_retries: i32,

    /// Max image dimension after normalization, in pixels
    #[serde(default = "default_preprocess_max_dimension")]
    pub preprocess_max_dimension: u32,

    /// Denoise filter strength; 0 disables
    #[serde(default = "default_preprocess_denoise_strength")]
    pub preprocess_denoise_strength: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "json" or "text"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Days to retain processed blobs. Recorded for operators; no handler
    /// consumes it yet.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_storage_bucket() -> String {
    "images".to_string()
}

fn default_storage_region() -> String {
    "auto".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_gemini_max_tokens() -> u32 {
    1024
}

fn default_gemini_temperature() -> f32 {
    1.0
}

fn default_gemini_timeout() -> u64 {
    30
}

fn default_worker_poll_interval() -> u64 {
    5
}

fn default_worker_batch_size() -> usize {
    10
}

fn default_worker_max_retries() -> i32 {
    3
}

fn default_preprocess_max_dimension() -> u32 {
    2048
}

fn default_preprocess_denoise_strength() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_retention_days() -> u32 {
    90
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
