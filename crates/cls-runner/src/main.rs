//! Closed-loop flicker stimulation runner
//!
//! Signal flow: LFP source → processing pipeline → spectral analysis →
//! frequency controller → stimulus device, one block at a time.

mod config;
mod session;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use cls_simulation::{start_block_stream, SimulatedStimulator, StreamCommand};
use config::ExperimentConfig;
use session::{ClosedLoopSession, SessionCommand};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, trials, log } => run(config.as_deref(), trials, log.as_deref()).await,
        Commands::PrintConfig { config } => print_config(config.as_deref()),
    }
}

async fn run(config_path: Option<&Path>, trials: Option<u32>, log: Option<&Path>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(trials) = trials {
        config.control.protocol.trials = trials;
    }
    if let Some(log) = log {
        config.control.trial_log = Some(log_path(log));
    }
    config.validate()?;

    tracing::info!(
        trials = config.control.protocol.trials,
        block_ms = config.control.protocol.block_period_ms,
        strategy = ?config.control.strategy,
        "starting closed-loop session"
    );

    let stimulator = SimulatedStimulator::new();
    let (frames, stream_control) = start_block_stream(config.stream.clone(), Some(stimulator.handle()))
        .await
        .context("starting the data source")?;
    let mut session = ClosedLoopSession::new(&config, Box::new(stimulator), frames)
        .context("building the closed-loop session")?;

    let commands = session.command_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = commands.send(SessionCommand::Stop).await;
        }
    });
    if config.control.protocol.self_initiated {
        tracing::info!("self-initiated trials: press Enter to respond");
        let commands = session.command_handle();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                if commands.send(SessionCommand::Respond).await.is_err() {
                    break;
                }
            }
        });
    }

    stream_control.send(StreamCommand::Start).await?;
    let stats = session.run().await?;
    let _ = stream_control.send(StreamCommand::Stop).await;

    tracing::info!(
        blocks = stats.blocks_processed,
        lagged = stats.lagged_blocks,
        trials = stats.trial,
        updates = stats.updates,
        final_frequency = stats.frequency,
        "done"
    );
    Ok(())
}

fn print_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("{}", config.to_json()?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::load(path),
        None => Ok(ExperimentConfig::default()),
    }
}

/// A directory gets a timestamped file name
fn log_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(format!("session_{}.csv", Utc::now().format("%Y%m%d_%H%M%S")))
    } else {
        path.to_path_buf()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Closed-loop flicker stimulation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a session against the simulated LFP source and stimulator
    Run {
        /// Experiment configuration (JSON); built-in defaults otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the number of trials
        #[arg(short, long)]
        trials: Option<u32>,
        /// Trial log CSV, or a directory for a timestamped one
        #[arg(short, long)]
        log: Option<PathBuf>,
    },
    /// Print the effective configuration as JSON
    PrintConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
