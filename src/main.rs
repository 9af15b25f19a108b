use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{self, EnvFilter};

use quorum_da::das::{allocate, CodecLayout, CommitmentStrategy, MerkleTree};
use quorum_da::types::{NodeId, StakeWeights};
use quorum_da::{client_version, random_object, Config, LocalNetwork};

#[derive(Parser)]
#[command(name = "quorum-da")]
#[command(about = "Data availability sampling with stake-weighted complaints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Raw,
    NodeTree,
}

impl From<Strategy> for CommitmentStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Raw => CommitmentStrategy::RawObject,
            Strategy::NodeTree => CommitmentStrategy::NodeTree,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one epoch on a local in-memory network
    Simulate {
        /// Object size in bytes
        #[arg(long)]
        object_size: Option<usize>,

        /// Number of equally staked validators
        #[arg(long)]
        validators: Option<usize>,

        /// Validators whose shares are dropped
        #[arg(long)]
        withheld: Option<usize>,

        /// Validators that complain without cause
        #[arg(long)]
        false_complaints: Option<usize>,

        /// Encode a different object than the committed one
        #[arg(long)]
        corrupt: bool,

        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
    },

    /// Print the commitment and encoding layout of a file
    Commit {
        file: PathBuf,

        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
    },

    /// Print the share ranges for a stake table
    Allocate {
        /// Number of shares
        #[arg(short, long)]
        shares: usize,

        /// Comma separated stakes, one per recipient
        #[arg(long, value_delimiter = ',', required = true)]
        stakes: Vec<u64>,
    },

    /// Print the default configuration or write it to a file
    Config {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    if config.log.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    info!("{}", client_version());

    match cli.command {
        Commands::Simulate {
            object_size,
            validators,
            withheld,
            false_complaints,
            corrupt,
            strategy,
        } => {
            let sim = &mut config.simulation;
            if let Some(size) = object_size {
                sim.object_size = size;
            }
            if let Some(count) = validators {
                sim.validators = count;
                sim.stakes.clear();
            }
            if let Some(count) = withheld {
                sim.withheld = count;
            }
            if let Some(count) = false_complaints {
                sim.false_complaints = count;
            }
            sim.corrupt |= corrupt;
            if let Some(strategy) = strategy {
                config.das.strategy = strategy.into();
            }
            config.validate()?;
            simulate(&config).await?;
        }

        Commands::Commit { file, strategy } => {
            if let Some(strategy) = strategy {
                config.das.strategy = strategy.into();
            }
            commit_file(&config, &file)?;
        }

        Commands::Allocate { shares, stakes } => {
            let weights = StakeWeights::try_from_iter(
                stakes
                    .iter()
                    .enumerate()
                    .map(|(i, stake)| (NodeId::from_index(i as u64 + 1), *stake)),
            )?;
            let allocation = allocate(shares, &weights)?;
            for (id, range) in allocation.iter() {
                println!(
                    "{} stake {:>8} shares {:>6} [{}..{})",
                    id,
                    weights.weight_of(id).unwrap_or(0),
                    range.len(),
                    range.start,
                    range.end
                );
            }
        }

        Commands::Config { output } => match output {
            Some(path) => {
                config.to_file(&path)?;
                info!("Configuration written to {}", path.display());
            }
            None => print!("{}", toml::to_string_pretty(&config)?),
        },
    }

    Ok(())
}

async fn simulate(config: &Config) -> Result<()> {
    let network = LocalNetwork::from_config(config)?;
    let plan = network.plan(config);
    let object = random_object(config.simulation.object_size, config.simulation.seed);

    info!(
        "Simulating a {} byte object over {} validators ({} withheld, {} false complaints, corrupt: {})",
        object.len(),
        network.validators().len(),
        plan.withheld.len(),
        plan.false_complaints.len(),
        plan.corrupt
    );
    let report = network.run_epoch(&object, &plan).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn commit_file(config: &Config, file: &Path) -> Result<()> {
    let object = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let das = config.das_config();
    let layout = CodecLayout::for_object(&das, object.len() as u64)?;
    let tree = MerkleTree::over_object(&object, das.unit_size);

    let summary = serde_json::json!({
        "file": file.display().to_string(),
        "commitment": format!("0x{}", hex::encode(tree.commitment().as_h256().as_bytes())),
        "merkle_root": format!("0x{}", hex::encode(tree.root().as_bytes())),
        "leaves": tree.leaf_count(),
        "depth": tree.depth(),
        "layout": layout,
        "total_shares": layout.total_shares(),
        "threshold": layout.threshold(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
