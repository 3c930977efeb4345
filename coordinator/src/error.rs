//! Coordinator error taxonomy.
//!
//! Validation and concurrency failures are recoverable client errors;
//! verification distinguishes pending (retryable, no state change)
//! from failed; chain RPC errors split transient from permanent; and
//! cryptographic mismatches are fatal for the attempt.

use swap_protocols::OrderError;
use thiserror::Error;

use crate::store::StoreError;
use crate::vault::VaultError;
use crate::verifier::VerifierError;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    #[error(transparent)]
    Hashlock(#[from] hashlock::HashlockError),
    #[error("scope already claimed: order {order_id}, segment {segment_id:?}")]
    AlreadyClaimed { order_id: String, segment_id: Option<u8> },
    #[error("no active auction for order {order_id}")]
    AuctionNotActive { order_id: String },
    #[error("resolver {resolver_id} is not the winner for order {order_id}")]
    NotWinner { resolver_id: String, order_id: String },
    #[error("coordinator is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Stable machine-readable code for API and bus surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::Order(OrderError::UnknownOrder(_)) => "unknown_order",
            CoordinatorError::Order(OrderError::UnknownSegment { .. }) => "unknown_segment",
            CoordinatorError::Order(OrderError::InvalidTransition { .. }) => "invalid_transition",
            CoordinatorError::Order(OrderError::TerminalOrder(_)) => "invalid_transition",
            CoordinatorError::Order(OrderError::MalformedRequest(_)) => "malformed_request",
            CoordinatorError::Order(OrderError::InvalidTimelocks(_)) => "invalid_timelocks",
            CoordinatorError::Store(StoreError::NotFound(_)) => "unknown_order",
            CoordinatorError::Store(StoreError::AlreadyExists(_)) => "order_exists",
            CoordinatorError::Store(StoreError::Transition(_)) => "invalid_transition",
            CoordinatorError::Store(StoreError::Persistence(_)) => "storage_unavailable",
            CoordinatorError::Store(StoreError::Codec(_)) => "storage_unavailable",
            CoordinatorError::Vault(VaultError::NotVerified { .. }) => "not_verified",
            CoordinatorError::Vault(VaultError::AlreadyReleased { .. }) => "already_released",
            CoordinatorError::Vault(VaultError::UnknownSecret { .. }) => "unknown_secret",
            CoordinatorError::Vault(VaultError::HashMismatch { .. }) => "hash_mismatch",
            CoordinatorError::Verifier(VerifierError::Pending { .. }) => "verification_pending",
            CoordinatorError::Verifier(VerifierError::Failed { .. }) => "verification_failed",
            CoordinatorError::Verifier(VerifierError::UnknownChain(_)) => "unknown_chain",
            CoordinatorError::Verifier(VerifierError::Transient(_)) => "chain_rpc_transient",
            CoordinatorError::Verifier(VerifierError::Permanent(_)) => "chain_rpc_failed",
            CoordinatorError::Hashlock(_) => "hash_mismatch",
            CoordinatorError::AlreadyClaimed { .. } => "already_claimed",
            CoordinatorError::AuctionNotActive { .. } => "auction_not_active",
            CoordinatorError::NotWinner { .. } => "not_winner",
            CoordinatorError::ShuttingDown => "shutting_down",
            CoordinatorError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the error maps to on the relayer API.
    pub fn http_status(&self) -> u16 {
        match self {
            CoordinatorError::Order(OrderError::UnknownOrder(_))
            | CoordinatorError::Store(StoreError::NotFound(_)) => 404,
            CoordinatorError::Order(OrderError::MalformedRequest(_))
            | CoordinatorError::Order(OrderError::InvalidTimelocks(_))
            | CoordinatorError::Order(OrderError::UnknownSegment { .. })
            | CoordinatorError::Hashlock(_)
            | CoordinatorError::Vault(VaultError::HashMismatch { .. }) => 400,
            CoordinatorError::Order(OrderError::InvalidTransition { .. })
            | CoordinatorError::Order(OrderError::TerminalOrder(_))
            | CoordinatorError::Store(StoreError::Transition(_))
            | CoordinatorError::Store(StoreError::AlreadyExists(_))
            | CoordinatorError::Vault(VaultError::NotVerified { .. })
            | CoordinatorError::Vault(VaultError::AlreadyReleased { .. })
            | CoordinatorError::Verifier(VerifierError::Pending { .. })
            | CoordinatorError::AlreadyClaimed { .. }
            | CoordinatorError::AuctionNotActive { .. }
            | CoordinatorError::NotWinner { .. } => 409,
            CoordinatorError::Vault(VaultError::UnknownSecret { .. }) => 409,
            CoordinatorError::Verifier(VerifierError::UnknownChain(_)) => 400,
            CoordinatorError::Verifier(VerifierError::Failed { .. })
            | CoordinatorError::Verifier(VerifierError::Transient(_))
            | CoordinatorError::Verifier(VerifierError::Permanent(_)) => 502,
            CoordinatorError::Store(StoreError::Persistence(_))
            | CoordinatorError::Store(StoreError::Codec(_))
            | CoordinatorError::ShuttingDown
            | CoordinatorError::Internal(_) => 500,
        }
    }
}
