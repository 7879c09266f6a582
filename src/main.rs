// ABOUTME: CLI entry point for warehouse-replicator
// ABOUTME: Parses commands, loads the pipeline config and runs streams once or on a schedule

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use warehouse_replicator::cdc::checkpoint::FileCheckpointStore;
use warehouse_replicator::cdc::watermark::{Watermark, WATERMARK_KEY};
use warehouse_replicator::utils::{sanitize_url, validate_connection_string};
use warehouse_replicator::{PipelineConfig, PipelineRunner};

#[derive(Parser)]
#[command(name = "warehouse-replicator")]
#[command(about = "Incremental PostgreSQL-to-warehouse replication through a Parquet landing zone", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the pipeline configuration file
    #[arg(long, global = true, default_value = "replicator.toml")]
    config: PathBuf,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Source database URL (overrides source.url)
    #[arg(long, env = "SOURCE_DATABASE_URL", global = true)]
    source: Option<String>,
    /// Staging database URL (overrides staging.url)
    #[arg(long, env = "STAGING_DATABASE_URL", global = true)]
    staging: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate changed rows into the landing zone and staging tables
    Run {
        /// Run only this stream
        #[arg(long)]
        stream: Option<String>,
        /// Run a single cycle and exit instead of following the schedule
        #[arg(long)]
        once: bool,
    },
    /// Inspect committed checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Parse and validate the configuration file, then exit
    ValidateConfig,
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Show the committed watermark and metadata of each stream
    Show {
        #[arg(long)]
        stream: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log, which defaults to "info"
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    warehouse_replicator::postgres::connection::init_tls_policy(cli.allow_self_signed_certs);

    let mut config = PipelineConfig::load(&cli.config)?;
    if let Some(source) = cli.source {
        validate_connection_string(&source).context("Invalid source URL")?;
        config.source.url = Some(source);
    }
    if let Some(staging) = cli.staging {
        validate_connection_string(&staging).context("Invalid staging URL")?;
        config.staging.url = Some(staging);
    }

    match cli.command {
        Commands::ValidateConfig => {
            println!("Configuration {:?} is valid", cli.config);
            println!("  Streams: {}", config.streams.len());
            for stream in &config.streams {
                println!(
                    "    {} <- {} (event columns: {})",
                    stream.key,
                    stream.table,
                    stream.watermark_columns().join(", ")
                );
            }
            if let Some(url) = &config.source.url {
                println!("  Source: {}", sanitize_url(url));
            }
            if let Some(url) = &config.staging.url {
                println!("  Staging: {}", sanitize_url(url));
            }
            Ok(())
        }
        Commands::Checkpoint {
            command: CheckpointCommands::Show { stream },
        } => show_checkpoints(&config, stream.as_deref()).await,
        Commands::Run { stream, once } => run(config, stream, once).await,
    }
}

async fn run(config: PipelineConfig, stream: Option<String>, once: bool) -> anyhow::Result<()> {
    let runner = PipelineRunner::connect(config).await?;

    if let Some(key) = stream {
        let report = runner.run_stream(&key).await?;
        println!("Stream '{}' complete", report.stream_key);
        println!("  Rows extracted: {}", report.records_extracted);
        println!("  Landed: {}", report.stage.uri());
        println!(
            "  Watermark: {} -> {}",
            report.watermark_before,
            report.watermark_after()
        );
        for (key, value) in report.metadata() {
            println!("  {}: {}", key, value);
        }
        return Ok(());
    }

    if once {
        let stats = runner.run_all().await;
        println!("Replication cycle complete");
        println!("  Streams succeeded: {}", stats.streams_succeeded);
        println!("  Rows extracted: {}", stats.records_extracted);
        println!("  Duration: {}ms", stats.duration_ms);
        if !stats.errors.is_empty() {
            for (key, error) in &stats.errors {
                println!("  Failed: {}: {}", key, error);
            }
            anyhow::bail!("{} stream(s) failed", stats.errors.len());
        }
        return Ok(());
    }

    tracing::info!("Press Ctrl+C to stop");
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    runner.run_scheduled(shutdown_rx).await
}

async fn show_checkpoints(config: &PipelineConfig, stream: Option<&str>) -> anyhow::Result<()> {
    let store = FileCheckpointStore::new(&config.checkpoint.state_path);
    let file = store.snapshot().await?;

    println!("Checkpoints in {:?}", store.path());
    for entry in &config.streams {
        if stream.is_some_and(|key| key != entry.key) {
            continue;
        }
        match file.streams.get(&entry.key) {
            Some(checkpoint) => {
                let watermark = checkpoint
                    .metadata
                    .get(WATERMARK_KEY)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| Watermark::sentinel().to_string());
                println!(
                    "  {}: {} (committed {})",
                    entry.key, watermark, checkpoint.committed_at
                );
                for (key, value) in &checkpoint.metadata {
                    if key != WATERMARK_KEY {
                        println!("      {} = {}", key, value);
                    }
                }
            }
            None => println!(
                "  {}: {} (never committed)",
                entry.key,
                Watermark::sentinel()
            ),
        }
    }
    Ok(())
}
