// Configuration for the Crosslock resolver
// Coordinator endpoints, per-chain drivers, timelock policy, strategy

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use swap_protocols::{OrderError, Timelocks};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Identity presented to the coordinator in claims and progress.
    pub resolver_id: String,
    /// Coordinator HTTP API base, e.g. `http://127.0.0.1:9300`.
    pub coordinator_api: String,
    /// Coordinator event-bus WebSocket URL, e.g. `ws://127.0.0.1:9301`.
    pub coordinator_ws: String,
    /// Chain drivers keyed by symbolic chain id.
    pub chains: HashMap<String, ChainDriverConfig>,
    pub timelocks: TimelockOffsets,
    pub strategy: StrategyConfig,
    /// Print chain commands instead of executing them.
    pub dry_run: bool,
}

/// Chain family the driver speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverFamily {
    Evm,
    Stellar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDriverConfig {
    pub family: DriverFamily,
    /// JSON-RPC endpoint (EVM) or Horizon base URL (Stellar) for
    /// read-side observation.
    pub rpc_url: String,
    /// Account the chain CLI signs with.
    pub account: String,
    /// Escrow factory contract address on this chain.
    pub escrow_factory: String,
    /// Network passphrase / chain name passed to the CLI.
    pub network: String,
    /// Wrapped-native token address, for chains where native value
    /// must be wrapped before escrow funding.
    pub wrapped_native: Option<String>,
}

/// Per-window offsets, in seconds from escrow creation. Both escrows
/// of a pair use the same windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimelockOffsets {
    pub withdrawal_secs: u64,
    pub public_withdrawal_secs: u64,
    pub cancellation_secs: u64,
    pub public_cancellation_secs: u64,
}

impl TimelockOffsets {
    /// Materialize windows anchored at `base` (unix seconds).
    pub fn at(&self, base: u64) -> Result<Timelocks, OrderError> {
        Timelocks::from_offsets(
            base,
            self.withdrawal_secs,
            self.public_withdrawal_secs,
            self.cancellation_secs,
            self.public_cancellation_secs,
        )
    }
}

/// When to claim a descending auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Claim once the current price is within this factor of the end
    /// price: `current <= end * (1 + margin)`.
    pub claim_margin: Decimal,
    /// Seconds between secret-request retries while verification is
    /// pending.
    pub secret_retry_secs: u64,
    /// Give up on a secret after this many pending retries.
    pub secret_max_retries: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            resolver_id: format!("resolver-{}", uuid::Uuid::new_v4()),
            coordinator_api: "http://127.0.0.1:9300".to_string(),
            coordinator_ws: "ws://127.0.0.1:9301".to_string(),
            chains: HashMap::new(),
            timelocks: TimelockOffsets {
                withdrawal_secs: 30,
                public_withdrawal_secs: 300,
                cancellation_secs: 1_800,
                public_cancellation_secs: 3_600,
            },
            strategy: StrategyConfig {
                claim_margin: Decimal::new(2, 2),
                secret_retry_secs: 5,
                secret_max_retries: 24,
            },
            dry_run: false,
        }
    }
}

impl ResolverConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ResolverConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timelocks
            .at(1)
            .map_err(|e| anyhow!("invalid timelock offsets: {}", e))?;
        if self.strategy.claim_margin < Decimal::ZERO {
            return Err(anyhow!("strategy.claim_margin must be non-negative"));
        }
        if self.chains.is_empty() {
            return Err(anyhow!("at least one chain driver must be configured"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timelock_offsets_materialize() {
        let offsets = TimelockOffsets {
            withdrawal_secs: 10,
            public_withdrawal_secs: 60,
            cancellation_secs: 300,
            public_cancellation_secs: 600,
        };
        let timelocks = offsets.at(1_000).unwrap();
        assert_eq!(timelocks.withdrawal_start, 1_010);
        assert_eq!(timelocks.public_cancellation_start, 1_600);
    }

    #[test]
    fn test_default_config_needs_chains() {
        let config = ResolverConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_monotonic_offsets_rejected() {
        let mut config = ResolverConfig::default();
        config.chains.insert(
            "evm-sepolia".into(),
            ChainDriverConfig {
                family: DriverFamily::Evm,
                rpc_url: "http://localhost:8545".into(),
                account: "0xresolver".into(),
                escrow_factory: "0xfactory".into(),
                network: "sepolia".into(),
                wrapped_native: None,
            },
        );
        config.timelocks.public_withdrawal_secs = config.timelocks.withdrawal_secs;
        assert!(config.validate().is_err());
    }
}
