use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use verum_node::config::{FaultKind, NodeConfig, TransportKind};
use verum_node::{devstack, logging};
use verum_protocol::JobState;

const DEFAULT_CONFIG: &str = "./verum.toml";

#[derive(Parser)]
#[command(name = "verum")]
#[command(about = "Verum - redundant job execution with result verification", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a requester and compute participants in one process and submit a job
    Devstack {
        /// Number of compute participants
        #[arg(short, long)]
        nodes: Option<usize>,

        /// How many of the participants misbehave
        #[arg(long)]
        faulty: Option<usize>,

        /// How faulty participants misbehave
        #[arg(long, value_enum)]
        fault: Option<FaultKind>,

        /// Message transport between participants
        #[arg(long, value_enum)]
        transport: Option<TransportKind>,

        #[arg(long)]
        shards: Option<u32>,

        /// Executions solicited per shard
        #[arg(long)]
        concurrency: Option<usize>,

        /// Agreeing executions required to accept a result
        #[arg(long)]
        confidence: Option<usize>,

        #[arg(long)]
        min_bids: Option<usize>,
    },

    /// Write a configuration file with default values
    Init {
        /// Output file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    // Priority order: CLI args > ENV vars > config file > defaults
    let mut config = match path {
        Some(path) => NodeConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => NodeConfig::from_file(Path::new(DEFAULT_CONFIG))?,
        None => NodeConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    logging::init_logging(&config.logging, cli.verbose).context("initializing logging")?;

    match cli.command {
        Commands::Devstack {
            nodes,
            faulty,
            fault,
            transport,
            shards,
            concurrency,
            confidence,
            min_bids,
        } => {
            let devstack = &mut config.devstack;
            if let Some(nodes) = nodes {
                devstack.compute_nodes = nodes;
            }
            if let Some(faulty) = faulty {
                devstack.faulty_nodes = faulty;
            }
            if let Some(fault) = fault {
                devstack.fault = fault;
            }
            if let Some(transport) = transport {
                devstack.transport = transport;
            }
            if let Some(shards) = shards {
                devstack.shards = shards;
            }
            if let Some(concurrency) = concurrency {
                devstack.concurrency = concurrency;
            }
            if let Some(confidence) = confidence {
                devstack.confidence = confidence;
            }
            if let Some(min_bids) = min_bids {
                devstack.min_bids = min_bids;
            }

            info!(
                compute_nodes = config.devstack.compute_nodes,
                faulty_nodes = config.devstack.faulty_nodes,
                transport = ?config.devstack.transport,
                shards = config.devstack.shards,
                concurrency = config.devstack.concurrency,
                confidence = config.devstack.confidence,
                "🚀 Starting devstack"
            );

            let status = devstack::run(&config).await?;
            print!("{}", devstack::render(&status));

            if status.state != JobState::Completed {
                warn!(state = %status.state, "⚠️ Job did not complete cleanly");
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Init { output } => {
            info!(output = ?output, "🧬 Writing default configuration");
            NodeConfig::default().save_to_file(&output)?;
            Ok(())
        }
    }
}
