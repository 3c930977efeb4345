//! Chain capability interface.
//!
//! The orchestrator is generic over [`ChainDriver`]; each chain family
//! implements the same five capabilities — approve, transfer, invoke,
//! observe-transfer, observe-effects — and hides its own asymmetries
//! (native wrapping on EVM chains, dual allowances on Stellar) inside
//! the driver.

use async_trait::async_trait;
use hashlock::Bytes32;
use serde::{Deserialize, Serialize};
use swap_protocols::{EscrowSide, Timelocks};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain command failed: {0}")]
    Command(String),
    #[error("chain rpc error: {0}")]
    Rpc(String),
    #[error("malformed chain response: {0}")]
    Malformed(String),
    #[error("unsupported operation for this chain: {0}")]
    Unsupported(String),
}

/// Everything needed to create one escrow of a pair. The same
/// hashlock and windows parameterize both sides; `side` is an explicit
/// discriminator, never inferred from addresses.
#[derive(Debug, Clone)]
pub struct EscrowSpec {
    pub side: EscrowSide,
    pub hash_lock: Bytes32,
    /// Who may withdraw with the secret: the resolver on src, the
    /// buyer on dst.
    pub recipient: String,
    /// Refund address for the src side creator path.
    pub buyer: Option<String>,
    pub token: String,
    pub amount: u128,
    pub timelocks: Timelocks,
    /// Present for segmented fills.
    pub segment: Option<SegmentFill>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFill {
    pub segment_id: u8,
    pub total_segments: u8,
}

/// One escrow operation, formatted per chain by the driver.
#[derive(Debug, Clone)]
pub enum EscrowAction {
    Create(EscrowSpec),
    Withdraw {
        escrow_address: String,
        secret: Bytes32,
        /// Merkle proof for segmented fills; `None` for single.
        proof: Option<Vec<Bytes32>>,
    },
    Cancel {
        escrow_address: String,
    },
}

/// Result of a submitted chain operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOutcome {
    pub tx_hash: String,
    /// Address of the escrow created by a `Create` action.
    pub escrow_address: Option<String>,
}

/// An observed credit to an address, as seen from the chain's
/// read-side API.
#[derive(Debug, Clone)]
pub struct ObservedTransfer {
    pub tx_hash: String,
    pub amount: u128,
}

/// A recent effect on an account (Stellar semantics; EVM drivers
/// report this as unsupported).
#[derive(Debug, Clone)]
pub struct AccountEffect {
    pub kind: String,
    pub amount: Option<u128>,
}

#[async_trait]
pub trait ChainDriver: Send + Sync {
    /// Symbolic chain id this driver serves.
    fn chain_id(&self) -> &str;

    /// The resolver's account on this chain; used as the src escrow
    /// recipient.
    fn account(&self) -> &str;

    /// Grant the escrow factory spending rights over `amount` of
    /// `token`, wrapping native value first where the chain needs it.
    async fn approve(&self, token: &str, amount: u128) -> Result<TxOutcome, ChainError>;

    /// Plain token transfer.
    async fn transfer(&self, token: &str, to: &str, amount: u128)
        -> Result<TxOutcome, ChainError>;

    /// Submit an escrow operation.
    async fn invoke(&self, action: &EscrowAction) -> Result<TxOutcome, ChainError>;

    /// Most recent credits to `address`, newest first.
    async fn observe_transfer_to(
        &self,
        address: &str,
    ) -> Result<Vec<ObservedTransfer>, ChainError>;

    /// Recent account effects, newest first.
    async fn observe_account_effects(
        &self,
        address: &str,
    ) -> Result<Vec<AccountEffect>, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use swap_protocols::OrderError;

    #[test]
    fn test_escrow_spec_windows_validate() {
        let timelocks = Timelocks {
            withdrawal_start: 100,
            public_withdrawal_start: 90,
            cancellation_start: 200,
            public_cancellation_start: 300,
        };
        assert!(matches!(
            timelocks.validate(),
            Err(OrderError::InvalidTimelocks(_))
        ));
    }
}
