// Crosslock resolver binary
// Watches auctions, claims, and executes cross-chain swaps

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crosslock_resolver::config::ResolverConfig;
use crosslock_resolver::coordinator::CoordinatorClient;
use crosslock_resolver::runner::Runner;
use crosslock_resolver::swap::SwapOrchestrator;

/// Crosslock resolver: auction claiming and swap execution
#[derive(Parser)]
#[command(name = "crosslock-resolver")]
#[command(about = "Claims Dutch auctions and drives two-sided escrow swaps")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the coordinator and resolve auctions
    Run,
    /// Execute one already-won order (or segment) directly
    Execute {
        /// Order id to execute
        order_id: String,
        /// Segment id for segmented orders
        #[arg(long)]
        segment: Option<u8>,
    },
    /// Cancel an abandoned escrow pair once the window opens
    Cancel {
        /// Order id the escrows belong to
        order_id: String,
        /// Segment id for segmented orders
        #[arg(long)]
        segment: Option<u8>,
        /// Source-side escrow address
        #[arg(long)]
        src_escrow: String,
        /// Destination-side escrow address
        #[arg(long)]
        dst_escrow: String,
    },
    /// Validate the configuration file and exit
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<ResolverConfig> {
    match path {
        Some(path) => ResolverConfig::load_from_file(path),
        None => Ok(ResolverConfig::default()),
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
        Commands::Run => {
            config.validate()?;
            let drivers = crosslock_resolver::build_drivers(&config);
            let coordinator = Arc::new(CoordinatorClient::new(&config.coordinator_api));
            let orchestrator = Arc::new(SwapOrchestrator::new(
                config.clone(),
                coordinator,
                drivers,
            ));
            info!("resolver {} starting", config.resolver_id);
            Runner::new(config, orchestrator).run().await?;
        }
        Commands::Execute { order_id, segment } => {
            config.validate()?;
            let drivers = crosslock_resolver::build_drivers(&config);
            let coordinator = Arc::new(CoordinatorClient::new(&config.coordinator_api));
            let orchestrator = SwapOrchestrator::new(config, coordinator, drivers);
            orchestrator.execute(&order_id, segment).await?;
        }
        Commands::Cancel {
            order_id,
            segment,
            src_escrow,
            dst_escrow,
        } => {
            config.validate()?;
            let drivers = crosslock_resolver::build_drivers(&config);
            let coordinator = Arc::new(CoordinatorClient::new(&config.coordinator_api));
            let orchestrator = SwapOrchestrator::new(config, coordinator, drivers);
            orchestrator
                .cancel(&order_id, segment, &src_escrow, &dst_escrow)
                .await?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("configuration ok: resolver {}", config.resolver_id);
        }
    }

    Ok(())
}
