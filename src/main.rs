//! Magelink command line
//!
//! Usage:
//!   magelink tick                   # run every due job once (call from OS cron each minute)
//!   magelink tick --job retrieval   # run one job now, regardless of its schedule
//!   magelink release-lock <job>     # force-release a stuck job lock
//!   magelink serve                  # ops API + in-process cron daemon

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use magelink::{
    config::Config,
    cron::{JobSelector, ReleaseOutcome, RunOutcome},
    server::{init_tracing, start_server, Services},
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "magelink", version, about = "Node sync and routing engine")]
struct Cli {
    /// JSON configuration file (defaults come from MAGELINK_* variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scheduler tick
    Tick {
        /// "all" for every due job, or a job name
        #[arg(long, default_value = "all")]
        job: String,
    },
    /// Force-release a job lock older than its lock time
    ReleaseLock { job: String },
    /// Start the ops HTTP API and the cron daemon
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Tick { job } => {
            let services = Services::build(&config).await?;
            let report = services.cron.tick(Utc::now(), &JobSelector::parse(&job)).await?;
            for entry in &report.jobs {
                match &entry.outcome {
                    RunOutcome::NotDue => tracing::debug!("⏭️ {} not due", entry.job),
                    RunOutcome::Completed { runtime_ms } => {
                        tracing::info!("✅ {} completed in {} ms", entry.job, runtime_ms)
                    }
                    RunOutcome::Failed { message, .. } => tracing::error!("❌ {}", message),
                    RunOutcome::Stalled { notified, .. } => {
                        tracing::warn!("🔒 {} still locked (operator notified: {})", entry.job, notified)
                    }
                }
            }
        }
        Command::ReleaseLock { job } => {
            let services = Services::build(&config).await?;
            match services.cron.admin_release_lock(&job, Utc::now()).await? {
                ReleaseOutcome::Released => tracing::info!("🔓 Lock of {} released", job),
                ReleaseOutcome::NotLocked => tracing::info!("🔓 {} was not locked", job),
                ReleaseOutcome::Refused {
                    locked_since,
                    lock_time_minutes,
                } => anyhow::bail!(
                    "Refusing to release {}: locked since {:?}, lock time is {} minutes",
                    job,
                    locked_since,
                    lock_time_minutes
                ),
                ReleaseOutcome::Failed => anyhow::bail!("Lock of {} could not be removed", job),
            }
        }
        Command::Serve => start_server(config).await?,
    }

    Ok(())
}
