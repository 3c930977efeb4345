// Configuration for the Crosslock coordinator node
// Loaded from TOML, validated before the node starts

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Coordinator node id, used in logs and bus identification.
    pub node_id: String,
    /// Listening port for the relayer HTTP API.
    pub api_port: u16,
    /// WebSocket port for the event bus.
    pub ws_port: u16,
    pub auction: AuctionConfig,
    pub verifier: VerifierConfig,
    pub storage: StorageConfig,
    pub bus: BusConfig,
}

/// Dutch-auction schedule parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionConfig {
    /// Seconds between price reductions.
    pub tick_interval_secs: u64,
    /// Multiplicative reduction per tick, as a decimal string.
    pub tick_factor: rust_decimal::Decimal,
    /// Inactivity window after which an unclaimed auction is expired.
    pub soft_deadline_secs: u64,
}

/// Escrow verification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Deadline for a single chain RPC call, in seconds.
    pub per_call_timeout_secs: u64,
    /// Overall verification deadline across retries, in seconds.
    pub overall_deadline_secs: u64,
    /// Base backoff delay between retries, in milliseconds.
    pub retry_base_ms: u64,
    /// Chain endpoints keyed by symbolic chain id.
    pub chains: HashMap<String, ChainEndpoint>,
}

/// Chain family a symbolic chain id belongs to. Decides which evidence
/// query strategy the verifier uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Evm,
    Stellar,
}

/// One chain the verifier can pull evidence from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub family: ChainFamily,
    /// JSON-RPC endpoint for EVM chains, Horizon base URL for Stellar.
    pub endpoint: String,
    /// Evidence freshness window in seconds.
    pub freshness_secs: u64,
    /// Block range scanned for EVM transfer logs.
    pub scan_blocks: u64,
    /// Decimal places of the chain's minor unit on Horizon responses.
    pub asset_decimals: u32,
}

impl ChainEndpoint {
    pub fn evm(endpoint: impl Into<String>) -> Self {
        ChainEndpoint {
            family: ChainFamily::Evm,
            endpoint: endpoint.into(),
            freshness_secs: 600,
            scan_blocks: 300,
            asset_decimals: 18,
        }
    }

    pub fn stellar(endpoint: impl Into<String>) -> Self {
        ChainEndpoint {
            family: ChainFamily::Stellar,
            endpoint: endpoint.into(),
            freshness_secs: 600,
            scan_blocks: 0,
            asset_decimals: 7,
        }
    }
}

/// Order store persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the sled database.
    pub data_dir: String,
    /// When false the store is purely in-memory (tests, dry runs).
    pub persistent: bool,
}

/// Event-bus limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bounded queue depth per subscriber; overflow drops the
    /// subscriber, never the publisher.
    pub queue_depth: usize,
    /// Maximum concurrent subscribers.
    pub max_subscribers: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            node_id: format!("coordinator-{}", uuid::Uuid::new_v4()),
            api_port: 9300,
            ws_port: 9301,
            auction: AuctionConfig {
                tick_interval_secs: 10,
                tick_factor: rust_decimal::Decimal::new(95, 2),
                soft_deadline_secs: 900,
            },
            verifier: VerifierConfig {
                per_call_timeout_secs: 10,
                overall_deadline_secs: 60,
                retry_base_ms: 500,
                chains: HashMap::new(),
            },
            storage: StorageConfig {
                data_dir: "./crosslock-data".to_string(),
                persistent: true,
            },
            bus: BusConfig {
                queue_depth: 64,
                max_subscribers: 1000,
            },
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoordinatorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_port == self.ws_port {
            return Err(anyhow!("api_port and ws_port must differ"));
        }
        if self.auction.tick_interval_secs == 0 {
            return Err(anyhow!("auction.tick_interval_secs must be positive"));
        }
        if self.auction.tick_factor <= rust_decimal::Decimal::ZERO
            || self.auction.tick_factor >= rust_decimal::Decimal::ONE
        {
            return Err(anyhow!("auction.tick_factor must be in (0, 1)"));
        }
        if self.bus.queue_depth == 0 {
            return Err(anyhow!("bus.queue_depth must be positive"));
        }
        if self.verifier.overall_deadline_secs < self.verifier.per_call_timeout_secs {
            return Err(anyhow!(
                "verifier.overall_deadline_secs must cover at least one call"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auction.tick_interval_secs, 10);
        assert_eq!(config.auction.tick_factor.to_string(), "0.95");
    }

    #[test]
    fn test_invalid_tick_factor_rejected() {
        let mut config = CoordinatorConfig::default();
        config.auction.tick_factor = rust_decimal::Decimal::new(15, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chain_endpoint_defaults() {
        let evm = ChainEndpoint::evm("http://localhost:8545");
        assert_eq!(evm.family, ChainFamily::Evm);
        assert_eq!(evm.freshness_secs, 600);
        let stellar = ChainEndpoint::stellar("https://horizon-testnet.stellar.org");
        assert_eq!(stellar.asset_decimals, 7);
    }
}
