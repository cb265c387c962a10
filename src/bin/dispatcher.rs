//! Pipeline dispatcher: reaps expired job leases and seeds the queue from
//! image states. Safe to run redundantly; enqueue is idempotent.

use clap::Parser;
use std::time::Duration;
use tokio::time::sleep;

use ean_extract::{
    config::AppConfig,
    db::{self, image_queries},
    init_tracing,
    pipeline::dispatcher::Dispatcher,
    services::queue::JobQueue,
};

#[derive(Parser)]
#[command(name = "dispatcher", about = "Pipeline job dispatcher")]
struct Cli {
    /// Max jobs enqueued per selector per cycle
    #[arg(long)]
    batch_size: Option<i64>,

    /// Seconds between dispatch cycles
    #[arg(long, default_value = "10")]
    poll_interval: u64,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Print a status histogram and exit
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    init_tracing(&config.log_level, &config.log_format);

    tracing::info!("Connecting to PostgreSQL");
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    if cli.stats {
        let stats = image_queries::pipeline_stats(&pool, None)
            .await
            .expect("Failed to query pipeline stats");
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).expect("Failed to serialize stats")
        );
        return;
    }

    let batch_size = cli.batch_size.unwrap_or(50);
    let queue = JobQueue::new(pool.clone());
    let dispatcher = Dispatcher::new(pool, queue, batch_size, config.worker_max_retries);

    tracing::info!(batch_size, poll_interval = cli.poll_interval, "Starting dispatcher");

    loop {
        match dispatcher.run_cycle().await {
            Ok(summary) => {
                if summary.total_enqueued() > 0 {
                    tracing::debug!(enqueued = summary.total_enqueued(), "cycle enqueued jobs");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "dispatch cycle failed");
            }
        }

        if cli.once {
            break;
        }

        sleep(Duration::from_secs(cli.poll_interval)).await;
    }
}
