use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use donorsync_adapters::cancel_pair;
use donorsync_storage::SnapshotStore;
use donorsync_sync::{build_scheduler, diff_files, DeltaOutcome, SyncConfig, SyncPipeline};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "donorsync")]
#[command(about = "Sync new donor-list rows from the portal export into the record store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, rotate, diff and upload once (default).
    Sync,
    /// Run `sync` on SYNC_CRON until interrupted.
    Schedule,
    /// Print rows of CURRENT newer than the head of PREVIOUS as JSON lines.
    Diff { previous: PathBuf, current: PathBuf },
    /// Finish a snapshot rotation that was interrupted by a crash.
    ResumeRotation {
        #[arg(long, env = "DOWNLOAD_DIR", default_value = "./downloads")]
        dir: PathBuf,
        #[arg(long, env = "SNAPSHOT_BASENAME", default_value = "download-donor-detail-recurring")]
        basename: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let result = run(cli.command.unwrap_or(Commands::Sync)).await;
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "donorsync failed");
    }
    result
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sync => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            let pipeline = SyncPipeline::new(config)?;

            let (handle, signal) = cancel_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling download");
                    handle.cancel();
                }
            });

            let summary = pipeline.run_once(signal).await?;
            println!(
                "sync complete: run_id={} status={:?} new_rows={} created={}",
                summary.run_id,
                summary.status,
                summary.new_rows,
                summary.created_record_ids.len()
            );
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let cron = pipeline.config().sync_cron.clone();

            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Diff { previous, current } => match diff_files(&previous, &current).await? {
            DeltaOutcome::NewRows(rows) => {
                for row in rows {
                    println!("{}", serde_json::to_string(&row)?);
                }
            }
            DeltaOutcome::UpToDate => info!("no new records"),
            DeltaOutcome::AnchorMissing { anchor } => {
                warn!(?anchor, "anchor row not found in current snapshot; no new records")
            }
        },
        Commands::ResumeRotation { dir, basename } => {
            let store = SnapshotStore::new(dir, basename);
            match store.resume().await? {
                Some(outcome) => info!(current = %outcome.current.display(), "rotation resumed"),
                None => info!("no interrupted rotation found"),
            }
        }
    }

    Ok(())
}
