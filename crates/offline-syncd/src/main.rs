//! offline-syncd: Headless host for the offline sync queue.
//!
//! Opens the durable queue in a data directory and drains it to a remote
//! authority over WebSocket, either once or continuously.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use offline_sync::{Backoff, DrainOutcome, RetryPolicy, SkipReason, SpaceType, SyncTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use offline_syncd::{DaemonConfig, Engine, WsTransport};

#[derive(Parser, Debug)]
#[command(name = "offline-syncd")]
#[command(about = "Offline-first document sync queue")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the queue (overrides OFFLINE_SYNC_DATA_DIR)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Workspace to drain into (overrides OFFLINE_SYNC_WORKSPACE)
    #[arg(short, long)]
    workspace: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print queue capacity and usage
    Status,
    /// List queued operations
    List {
        /// Only this document
        #[arg(long)]
        doc: Option<String>,
    },
    /// Merge each document's queued updates into one
    Compact,
    /// Queue an update read from a file
    Enqueue {
        /// Document id
        #[arg(long)]
        doc: String,
        /// File containing the encoded update
        #[arg(long)]
        file: PathBuf,
        /// Space id (defaults to the workspace)
        #[arg(long)]
        space: Option<String>,
        /// Queue into the user's own space instead of the workspace
        #[arg(long)]
        userspace: bool,
    },
    /// Send queued operations to the remote
    Drain {
        /// WebSocket URL (overrides OFFLINE_SYNC_SERVER)
        #[arg(short, long)]
        server: Option<String>,
        /// Keep running and drain periodically
        #[arg(long)]
        watch: bool,
        /// Seconds between passes in watch mode
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,offline_sync=debug,offline_syncd=debug"
    } else {
        "info,offline_sync=info,offline_syncd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(workspace) = args.workspace {
        config.engine.sync.workspace_id = Some(workspace);
    }
    info!("Data directory: {:?}", config.data_dir);

    let engine = Engine::open(config).await?;

    match args.command {
        Command::Status => {
            let status = engine.health.check().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::List { doc } => {
            let ops = match doc {
                Some(doc) => engine.queue.list_for_doc(&doc).await?,
                None => engine.queue.list().await?,
            };
            for op in &ops {
                println!(
                    "{}\t{}/{}\t{}\t{} bytes\t{}",
                    op.id,
                    op.space_type,
                    op.space_id,
                    op.doc_id,
                    op.update.len(),
                    op.timestamp
                );
            }
            info!("{} queued operations", ops.len());
        }
        Command::Compact => match engine.health.compact().await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => warn!("A compaction is already running"),
        },
        Command::Enqueue {
            doc,
            file,
            space,
            userspace,
        } => {
            let update = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let validation = engine.merge.validate(update.clone()).await?;
            if !validation.valid {
                bail!(
                    "{} is not a valid update: {}",
                    file.display(),
                    validation.error.unwrap_or_default()
                );
            }

            let space_type = if userspace {
                SpaceType::Userspace
            } else {
                SpaceType::Workspace
            };
            let Some(space_id) = space.or_else(|| engine.config.engine.sync.workspace_id.clone())
            else {
                bail!("No space id: pass --space or set a workspace");
            };
            let op = engine.enqueue(space_type, &space_id, &doc, update).await?;
            info!("Queued {} for {} ({} bytes)", op.id, op.doc_id, validation.size);
        }
        Command::Drain {
            server,
            watch,
            interval,
        } => {
            let Some(server) = server.or_else(|| engine.config.server_url.clone()) else {
                bail!("No server: pass --server or set OFFLINE_SYNC_SERVER");
            };
            run_drain(&engine, &server, watch, Duration::from_secs(interval.max(1))).await?;
        }
    }

    engine.merge.terminate();
    Ok(())
}

/// Connect and drain once, or keep draining (and reconnecting) in watch mode.
async fn run_drain(engine: &Engine, server: &str, watch: bool, interval: Duration) -> Result<()> {
    let policy = RetryPolicy::from_config(&engine.config.engine.sync);
    let mut reconnect = Backoff::new();

    loop {
        let transport = match WsTransport::connect(server).await {
            Ok(transport) => {
                reconnect.reset();
                Arc::new(transport)
            }
            Err(e) if watch => {
                let delay = reconnect.record_failure(Instant::now(), &policy);
                warn!("{}; reconnecting in {:?}", e, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let orchestrator = engine.orchestrator(transport.clone());
        if !watch {
            let outcome = orchestrator.drain().await?;
            log_outcome(&outcome);
            transport.close().await;
            return Ok(());
        }

        info!("Draining to {} every {:?}. Press Ctrl+C to stop.", server, interval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !transport.is_connected() {
                        warn!("Lost connection to {}", server);
                        break;
                    }
                    engine.health.check().await;
                    if let Err(e) = engine.health.maybe_compact(Instant::now()).await {
                        error!("Compaction failed: {}", e);
                    }
                    match orchestrator.drain().await {
                        Ok(outcome) => log_outcome(&outcome),
                        Err(e) => error!("Drain failed: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    transport.close().await;
                    return Ok(());
                }
            }
        }
    }
}

fn log_outcome(outcome: &DrainOutcome) {
    match outcome {
        DrainOutcome::Completed(report) if report.is_success() => {
            debug!("Pass complete: {} operations synced", report.succeeded);
        }
        DrainOutcome::Completed(report) => {
            warn!(
                "{} of {} operations failed; {} left in queue",
                report.failed.len(),
                report.attempted,
                report.retained
            );
        }
        DrainOutcome::Empty => debug!("Queue empty"),
        DrainOutcome::Skipped(SkipReason::BackingOff { remaining }) => {
            debug!("Backing off for {:?}", remaining);
        }
        DrainOutcome::Skipped(reason) => info!("Drain skipped: {:?}", reason),
    }
}
