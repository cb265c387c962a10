//! Pipeline worker: leases jobs of one stage and executes its handler.
//!
//! By default the worker drains the queue and exits after two consecutive
//! empty polls; `--continuous` keeps it polling, `--once` runs one batch.

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;

use ean_extract::{
    config::AppConfig,
    db,
    init_tracing,
    models::JobType,
    pipeline::{
        decode_fallback::DecodeFallbackHandler, decode_primary::DecodePrimaryHandler,
        preprocess::PreprocessHandler,
        worker::{RunMode, Worker, WorkerConfig},
        StageHandler,
    },
    services::{
        gemini::GeminiClient,
        normalize::{NormalizeOptions, Normalizer},
        queue::JobQueue,
        storage::S3BlobStore,
        zbar::ZbarCli,
    },
};

const LEASE_DURATION: Duration = Duration::from_secs(300);
const SAFETY_MARGIN: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    /// Normalize incoming images
    Preprocess,
    /// Local barcode decoding over preprocessed images
    DecodePrimary,
    /// AI fallback decoding for images the primary decoder gave up on
    DecodeFallback,
    /// Retry fallback decoding for failed images with budget left
    DecodeFailed,
}

#[derive(Parser)]
#[command(name = "worker", about = "Pipeline stage worker")]
struct Cli {
    /// Stage this worker executes
    #[arg(long, value_enum)]
    stage: Stage,

    /// Number of jobs per poll batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seconds between polls
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Run a single poll batch and exit
    #[arg(long)]
    once: bool,

    /// Keep polling even when the queue is drained
    #[arg(long)]
    continuous: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    init_tracing(&config.log_level, &config.log_format);

    tracing::info!(stage = ?cli.stage, "Starting pipeline worker");

    tracing::info!("Connecting to PostgreSQL");
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing blob storage client");
    let store: Arc<dyn ean_extract::services::storage::BlobStore> = Arc::new(
        S3BlobStore::new(
            &config.storage_bucket,
            &config.storage_endpoint,
            &config.storage_region,
            &config.storage_access_key,
            &config.storage_secret_key,
        )
        .expect("Failed to initialize blob storage client"),
    );

    let queue = JobQueue::new(pool.clone());

    let (job_type, handler): (JobType, Arc<dyn StageHandler>) = match cli.stage {
        Stage::Preprocess => {
            let options = NormalizeOptions {
                max_dimension: config.preprocess_max_dimension,
                denoise_strength: config.preprocess_denoise_strength,
                ..NormalizeOptions::default()
            };
            (
                JobType::Preprocess,
                Arc::new(PreprocessHandler::new(
                    pool.clone(),
                    Arc::clone(&store),
                    Arc::new(Normalizer),
                    options,
                )),
            )
        }
        Stage::DecodePrimary => (
            JobType::DecodePrimary,
            Arc::new(DecodePrimaryHandler::new(
                pool.clone(),
                Arc::clone(&store),
                Arc::new(ZbarCli::new()),
            )),
        ),
        Stage::DecodeFallback | Stage::DecodeFailed => {
            let gemini = GeminiClient::new(
                &config.gemini_api_key,
                &config.gemini_model,
                config.gemini_max_tokens,
                config.gemini_temperature,
                config.gemini_timeout,
            )
            .expect("Failed to initialize Gemini client");
            (
                JobType::DecodeFallback,
                Arc::new(DecodeFallbackHandler::new(
                    pool.clone(),
                    Arc::clone(&store),
                    Arc::new(gemini),
                )),
            )
        }
    };

    let worker_config = WorkerConfig {
        poll_interval: Duration::from_secs(cli.poll_interval.unwrap_or(config.worker_poll_interval)),
        batch_size: cli.batch_size.unwrap_or(config.worker_batch_size),
        lease_duration: LEASE_DURATION,
        safety_margin: SAFETY_MARGIN,
    };

    let worker = Worker::new(job_type, handler, queue, pool, worker_config);

    let mode = if cli.once {
        RunMode::Once
    } else if cli.continuous {
        RunMode::Continuous
    } else {
        RunMode::UntilDrained
    };

    let processed = worker.run(mode).await;
    tracing::info!(processed, "worker finished");
}
