//! Crosslock resolver: the counterparty side of a cross-chain swap.
//!
//! Watches the coordinator's auctions, claims when the Dutch price
//! decays into its margin, then drives the two-sided escrow protocol:
//! fund src and dst escrows under one hashlock and one set of timelock
//! windows, obtain the secret after the coordinator verifies both
//! sides, and withdraw on both chains. Chains are reached through the
//! [`chain::ChainDriver`] capability interface; EVM and Stellar
//! drivers are provided.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::ChainDriver;
use crate::config::{DriverFamily, ResolverConfig};
use crate::evm::EvmDriver;
use crate::stellar::StellarDriver;

pub mod chain;
pub mod config;
pub mod coordinator;
pub mod evm;
pub mod runner;
pub mod stellar;
pub mod swap;

pub use config::ResolverConfig as Config;

/// Instantiate one driver per configured chain.
pub fn build_drivers(config: &ResolverConfig) -> HashMap<String, Arc<dyn ChainDriver>> {
    let mut drivers: HashMap<String, Arc<dyn ChainDriver>> = HashMap::new();
    for (chain_id, chain_config) in &config.chains {
        let driver: Arc<dyn ChainDriver> = match chain_config.family {
            DriverFamily::Evm => Arc::new(EvmDriver::new(
                chain_id,
                chain_config.clone(),
                config.dry_run,
            )),
            DriverFamily::Stellar => Arc::new(StellarDriver::new(
                chain_id,
                chain_config.clone(),
                config.dry_run,
            )),
        };
        drivers.insert(chain_id.clone(), driver);
    }
    drivers
}
