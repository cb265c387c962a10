mod app_state;
mod config;
mod db;
mod models;
mod pipeline;
mod routes;
mod services;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use services::storage::S3BlobStore;

#[tokio::main]
async fn main() {
    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    // Initialize structured logging
    init_tracing(&config);

    tracing::info!("Initializing ean-extract review server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "pipeline_stage_duration_seconds",
        "Time spent executing one stage handler"
    );
    metrics::describe_counter!(
        "pipeline_jobs_processed_total",
        "Jobs processed by workers, by stage and outcome"
    );
    metrics::describe_counter!(
        "pipeline_jobs_dispatched_total",
        "Jobs enqueued by the dispatcher"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize blob storage client
    tracing::info!("Initializing blob storage client");
    let store = S3BlobStore::new(
        &config.storage_bucket,
        &config.storage_endpoint,
        &config.storage_region,
        &config.storage_access_key,
        &config.storage_secret_key,
    )
    .expect("Failed to initialize blob storage client");

    // Create shared application state
    let state = AppState::new(db_pool, Arc::new(store));

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/batches/:batch_id/images",
            post(routes::images::upload_image),
        )
        .route("/api/images/review", get(routes::images::list_review_images))
        .route("/api/images/:image_id", get(routes::images::get_image_detail))
        .route(
            "/api/images/:image_id/resolve",
            post(routes::images::resolve_image),
        )
        .route("/api/stats", get(routes::stats::get_stats))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(25 * 1024 * 1024)); // 25 MB limit

    tracing::info!("Starting ean-extract on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if config.log_format == "text" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}
