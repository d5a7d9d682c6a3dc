#![forbid(unsafe_code)]

//! Command-line entry point: mirrors the configured YouTube channels onto the
//! destination accounts.
//!
//! `Ctrl-C` cancels the root scope. The running extractor's process group is
//! killed, in-flight HTTP requests are abandoned and the pass stops before
//! the next video.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tube2bili_tools::config::{ConfigOverrides, RunMode, resolve_config};
use tube2bili_tools::error::ErrorKind;
use tube2bili_tools::orchestrator::{Orchestrator, PassSummary};
use tube2bili_tools::tools::Tools;

#[derive(Debug, Parser)]
#[command(name = "tube2bili", version, about = "Mirror YouTube channels to Bilibili")]
struct Cli {
    /// Configuration file (TOML). Falls back to `TUBE2BILI_CONFIG`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Work tree root. Falls back to `TUBE2BILI_OUTPUT_DIR`, then the file.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Full pipeline over every configured channel.
    Run {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Download pass only.
    Download,
    /// Upload every completed download.
    Upload,
    /// Refresh `channel_info.json` for every channel.
    ParseChannels,
    /// Mark downloads completed wherever the upload already completed.
    FixDownloadStatus,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Sync,
    Batch,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sync => RunMode::Sync,
            ModeArg::Batch => RunMode::Batch,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancels `cancel` on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupt received, stopping after cleanup");
                cancel.cancel();
            }
            Err(err) => tracing::warn!(error = %err, "could not install Ctrl-C handler"),
        }
    });
}

fn report(summary: PassSummary) {
    if summary.interrupted {
        tracing::warn!("pass interrupted before it finished");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = resolve_config(ConfigOverrides {
        config_path: cli.config.clone(),
        output_dir: cli.output_dir.clone(),
    })
    .context("loading configuration")?;
    if config.channels.is_empty() {
        tracing::warn!("no channels configured");
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let tools = match cli.command {
        Command::Run { .. } | Command::Download | Command::Upload => Tools::detect(&config.tools),
        Command::ParseChannels | Command::FixDownloadStatus => Tools::none(),
    };
    let default_mode = config.mode;
    let mut orchestrator =
        Orchestrator::new(config, tools).context("opening the work tree")?;

    match cli.command {
        Command::Run { mode } => {
            let mode = mode.map(RunMode::from).unwrap_or(default_mode);
            report(orchestrator.run(mode, &cancel).await?);
        }
        Command::Download => report(orchestrator.download_channels(&cancel).await?),
        Command::Upload => report(orchestrator.upload_all_channels(&cancel).await?),
        Command::ParseChannels => match orchestrator.parse_channels(&cancel).await {
            Ok(total) => tracing::info!(videos = total, "channel listings refreshed"),
            Err(err) if err.is(ErrorKind::Cancelled) => {
                tracing::warn!("channel parsing interrupted");
            }
            Err(err) => return Err(err).context("parsing channels"),
        },
        Command::FixDownloadStatus => {
            let repaired = orchestrator
                .fix_download_status()
                .context("repairing download status")?;
            println!("repaired {repaired} download status file(s)");
        }
    }
    Ok(())
}
