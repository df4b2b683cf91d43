use clap::{Parser, Subcommand};
use embedq::Result;
use embedq::config::Config;
use embedq::database::Database;
use embedq::embeddings::client::EmbeddingClient;
use embedq::maintenance::QueueMaintenance;
use embedq::pool::{ExitReason, ProcessorPool};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "embedq")]
#[command(about = "Queue-driven embedding pipeline for forum posts and comments")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the processor pool until shutdown or max runtime
    Run,
    /// Repair the queue: deduplicate, reset stuck jobs, requeue empty completions
    Maintain {
        /// Only deduplicate queue entries
        #[arg(long)]
        dedupe_only: bool,
    },
    /// Show queue depth, chunk counts, and recent throughput
    Status,
    /// Show the active configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_pool().await?,
        Commands::Maintain { dedupe_only } => run_maintenance(dedupe_only).await?,
        Commands::Status => show_status().await?,
        Commands::Config => show_config()?,
    }

    Ok(())
}

async fn run_pool() -> Result<()> {
    let config = Config::load()?;
    let database = Database::new(config.database_path()).await?;
    let client = EmbeddingClient::new(&config.provider)?;

    // A dead provider is a startup failure, not something to discover
    // batch by batch
    client.health_check()?;

    let pool = ProcessorPool::new(config, database, client);
    let summary = pool.run().await?;

    println!(
        "Run summary: {} claimed, {} completed, {} failed, {} deferred, {} rate-limit restarts",
        summary.claimed,
        summary.completed,
        summary.failed,
        summary.deferred,
        summary.rate_limit_restarts
    );
    if summary.exit_reason == ExitReason::RateLimitExhausted {
        error!("Pool halted: rate limit retry budget exhausted");
    }

    Ok(())
}

async fn run_maintenance(dedupe_only: bool) -> Result<()> {
    let config = Config::load()?;
    let database = Database::new(config.database_path()).await?;
    let maintenance = QueueMaintenance::new(database.clone(), config.pool.stuck_job_timeout_secs);

    if dedupe_only {
        let removed = maintenance.deduplicate().await?;
        println!("Removed {removed} duplicate queue entries");
    } else {
        let report = maintenance.run().await?;
        println!(
            "Maintenance: {} duplicates removed, {} stuck jobs reset, {} empty completions requeued",
            report.duplicates_removed, report.stuck_reset, report.requeued
        );
    }

    database.optimize().await?;
    Ok(())
}

async fn show_status() -> Result<()> {
    let config = Config::load()?;
    let database = Database::new(config.database_path()).await?;

    let stats = database.queue_stats().await?;
    println!("Queue:");
    println!("  pending:    {}", stats.pending_count);
    println!("  processing: {}", stats.processing_count);
    println!("  completed:  {}", stats.completed_count);
    println!("  failed:     {}", stats.failed_count);
    if let Some(age) = stats.oldest_pending_age_seconds {
        println!("  oldest pending: {age}s");
    }

    let chunk_count = database.total_chunk_count().await?;
    println!("Chunks stored: {chunk_count}");

    let by_subreddit = database.pending_by_subreddit().await?;
    if !by_subreddit.is_empty() {
        println!("Pending by subreddit:");
        for bucket in by_subreddit {
            println!(
                "  {}: {}",
                bucket.subreddit.as_deref().unwrap_or("(none)"),
                bucket.pending
            );
        }
    }

    let metrics = database.metrics_summary(60).await?;
    println!(
        "Last hour: {} jobs ({} ok), {} chunks",
        metrics.jobs_recorded, metrics.jobs_succeeded, metrics.total_chunks
    );
    if let Some(avg) = metrics.average_processing_time_ms {
        println!("  avg processing time: {avg:.0}ms");
    }

    info!("Status reported");
    Ok(())
}

fn show_config() -> Result<()> {
    let config = Config::load()?;
    let rendered =
        toml::to_string_pretty(&config).map_err(|e| embedq::EmbedqError::Config(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}
