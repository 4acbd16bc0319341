//! Uplink binary
//!
//! - `serve`: run the pipeline and its HTTP surface until SIGINT/SIGTERM
//! - `dead-letters`: print dead-lettered packets from the ledger
//! - `stats`: print ledger row counts per status

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uplink_ledger::UploadLedger;
use uplink_logging::{init_logging, LogConfig};
use uplink_pipeline::http::{self, AppState};
use uplink_pipeline::{CancellationToken, FilesystemStore, Pipeline};
use uplink_protocol::defaults::{
    DEFAULT_BIND_ADDR, DEFAULT_CONFIG_PATH, DEFAULT_DEAD_LETTER_LIMIT, DEFAULT_DEGRADED_BELOW,
    DEFAULT_LEDGER_PATH, DEFAULT_STORE_ROOT,
};
use uplink_protocol::PipelineConfig;

#[derive(Parser, Debug)]
#[command(name = "uplink", about = "Priority-aware ingestion and upload pipeline")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Upload ledger (SQLite) path
    #[arg(long, global = true, default_value = DEFAULT_LEDGER_PATH)]
    ledger: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline and serve /ingest, /health and /metrics
    Serve {
        /// Pipeline config (TOML)
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Root directory of the filesystem destination store
        #[arg(long, default_value = DEFAULT_STORE_ROOT)]
        store_root: PathBuf,

        #[arg(long, default_value = DEFAULT_BIND_ADDR)]
        bind: SocketAddr,

        /// Report degraded when the health score is below this
        #[arg(long, default_value_t = DEFAULT_DEGRADED_BELOW)]
        degraded_below: f64,
    },

    /// List dead-lettered packets, newest first
    DeadLetters {
        #[arg(short, long, default_value_t = DEFAULT_DEAD_LETTER_LIMIT)]
        limit: i64,
    },

    /// Show ledger row counts per status
    Stats,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_to_file = matches!(cli.command, Commands::Serve { .. });
    if let Err(err) = init_logging(LogConfig {
        app_name: "uplink",
        verbose: cli.verbose,
        log_to_file,
    }) {
        eprintln!("Warning: failed to initialize logging: {:?}", err);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("uplink")
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Serve {
                config,
                store_root,
                bind,
                degraded_below,
            } => serve(cli.ledger, config, store_root, bind, degraded_below).await,
            Commands::DeadLetters { limit } => dead_letters(cli.ledger, limit).await,
            Commands::Stats => stats(cli.ledger).await,
        }
    })
}

async fn serve(
    ledger_path: PathBuf,
    config_path: PathBuf,
    store_root: PathBuf,
    bind: SocketAddr,
    degraded_below: f64,
) -> Result<()> {
    let config = PipelineConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let ledger = UploadLedger::open(&ledger_path)
        .await
        .with_context(|| format!("Failed to open ledger {}", ledger_path.display()))?;
    let store = Arc::new(FilesystemStore::new(&store_root));

    info!(
        config = %config_path.display(),
        ledger = %ledger_path.display(),
        store = %store_root.display(),
        workers = config.worker_count,
        shards = config.shard_count,
        "Starting uplink"
    );

    let pipeline = Pipeline::new(config, ledger.clone(), store)?;
    pipeline.start().await?;

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let router = http::build_router(Arc::new(AppState {
        pipeline: pipeline.clone(),
        degraded_below,
    }));

    let stop = CancellationToken::new();
    let server = tokio::spawn(http::serve(listener, router, stop.clone()));

    wait_for_signal().await;
    info!("Shutdown signal received, draining");

    // Stop taking new packets first, then drain what was admitted.
    stop.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("HTTP server error: {}", e),
        Err(e) => warn!("HTTP server task failed: {}", e),
    }

    let report = pipeline.shutdown().await?;
    info!(
        drained = report.drain.drained,
        aborted = report.drain.aborted,
        persisted = report.persisted,
        "{}",
        pipeline.metrics().snapshot().summary()
    );
    ledger.close().await;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }
}

async fn dead_letters(ledger_path: PathBuf, limit: i64) -> Result<()> {
    let ledger = UploadLedger::open(&ledger_path)
        .await
        .with_context(|| format!("Failed to open ledger {}", ledger_path.display()))?;
    let letters = ledger.list_dead_letters(limit).await?;
    if letters.is_empty() {
        println!("No dead-lettered packets.");
    }
    for letter in &letters {
        println!(
            "{}  {}  {}  attempts={}  {}",
            letter.entry.packet_id,
            letter.packet.destination,
            letter.reason.as_str(),
            letter.entry.attempt_count,
            letter.entry.error_message.as_deref().unwrap_or("-"),
        );
    }
    ledger.close().await;
    Ok(())
}

async fn stats(ledger_path: PathBuf) -> Result<()> {
    let ledger = UploadLedger::open(&ledger_path)
        .await
        .with_context(|| format!("Failed to open ledger {}", ledger_path.display()))?;
    let stats = ledger.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    ledger.close().await;
    Ok(())
}
