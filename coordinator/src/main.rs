// Crosslock coordinator binary
// Dutch-auction matcher and HTLC relayer node

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crosslock_coordinator::{CoordinatorConfig, CoordinatorNode};

/// Crosslock coordinator: cross-chain HTLC swap matching and relaying
#[derive(Parser)]
#[command(name = "crosslock-coordinator")]
#[command(about = "Dutch-auction matcher and escrow relayer for cross-chain atomic swaps")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator node
    Start,
    /// Validate the configuration file and exit
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<CoordinatorConfig> {
    match path {
        Some(path) => CoordinatorConfig::load_from_file(path),
        None => Ok(CoordinatorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Start => {
            let node = CoordinatorNode::new(config).await?;
            node.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
            node.shutdown().await?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("configuration ok: node {}", config.node_id);
        }
    }

    Ok(())
}
