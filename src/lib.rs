//! EAN Extraction Pipeline
//!
//! Batch product-image barcode extraction: images move through a durable,
//! poll-driven job pipeline (preprocess, primary decode, AI fallback, manual
//! review) coordinated by leased jobs in the metadata store.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;

use tracing_subscriber::EnvFilter;

/// Initialize structured logging per LOG_LEVEL / LOG_FORMAT.
pub fn init_tracing(level: &str, format: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    if format == "text" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}
