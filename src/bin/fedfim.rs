//! Command-line driver for fedfim experiments.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use fedfim::checkpoint::{Checkpoint, FileCheckpointSink};
use fedfim::metrics::{JsonLinesSink, MetricsSink, RoundLog};
use fedfim::{ExperimentConfig, Orchestrator};

/// Final checkpoint location when the config names none
const DEFAULT_CHECKPOINT: &str = "fedfim-final.bin";

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "fedfim")]
#[command(about = "Federated learning simulation with Fisher-information regularisation")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a federated experiment
    Run {
        /// TOML experiment config (defaults are used when omitted)
        #[arg(short, long, env = "FEDFIM_CONFIG")]
        config: Option<PathBuf>,

        /// Override the number of rounds
        #[arg(long)]
        rounds: Option<usize>,

        /// Override the number of clients
        #[arg(long)]
        clients: Option<usize>,

        /// Train clients in parallel
        #[arg(long)]
        parallel: bool,

        /// Override the metrics output path (JSON lines)
        #[arg(long)]
        metrics: Option<PathBuf>,

        /// Override the final checkpoint path (default: fedfim-final.bin)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Print the tensors stored in a checkpoint
    Inspect {
        /// Checkpoint file written by `run`
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<ExperimentConfig> {
    match path {
        Some(p) => ExperimentConfig::load_from_file(p)
            .with_context(|| format!("loading config {}", p.display())),
        None => Ok(ExperimentConfig::default()),
    }
}

fn run(config: ExperimentConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let mut orchestrator = Orchestrator::from_config(config.clone())?;
    let mut metrics: Box<dyn MetricsSink> = match &config.output.metrics_path {
        Some(path) => Box::new(
            JsonLinesSink::create(path)
                .with_context(|| format!("opening metrics file {}", path.display()))?,
        ),
        None => Box::new(RoundLog::new()),
    };
    let checkpoint_path = config
        .output
        .checkpoint_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT));
    let mut checkpoints = FileCheckpointSink::new(checkpoint_path);

    let last = orchestrator.run(&mut *metrics, &mut checkpoints)?;
    info!(
        rounds = orchestrator.rounds_completed(),
        test_loss = last.test_loss,
        test_accuracy = last.test_accuracy,
        checkpoint = %checkpoints.path().display(),
        "Experiment finished"
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let checkpoint = Checkpoint::load(path)
        .with_context(|| format!("reading checkpoint {}", path.display()))?;
    println!("rounds completed: {}", checkpoint.rounds_completed);
    for (name, tensor) in &checkpoint.params {
        let (rows, cols) = tensor.dim();
        println!("{:<24} {:>5} x {:<5}", name, rows, cols);
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    match args.command {
        Command::Run {
            config,
            rounds,
            clients,
            parallel,
            metrics,
            checkpoint,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(r) = rounds {
                cfg.rounds = r;
            }
            if let Some(c) = clients {
                cfg.num_clients = c;
            }
            if parallel {
                cfg.parallel_clients = true;
            }
            if metrics.is_some() {
                cfg.output.metrics_path = metrics;
            }
            if checkpoint.is_some() {
                cfg.output.checkpoint_path = checkpoint;
            }
            run(cfg)
        }
        Command::Inspect { checkpoint } => inspect(&checkpoint),
    }
}
