//! Per-order swap state machine.
//!
//! After winning a claim the resolver walks the order through:
//! prepare src, create src escrow, create dst escrow, await
//! verification, obtain the secret, wait out the withdrawal window,
//! withdraw src, withdraw dst, done. Every step is reported to the
//! coordinator as a progress breadcrumb; the same timelock windows
//! parameterize both escrows of the pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use swap_protocols::{
    segment_amounts, EscrowSide, Order, OrderError, ProgressRequest, RequestSecretRequest,
    Timelocks, SEGMENT_COUNT,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::chain::{ChainDriver, ChainError, EscrowAction, EscrowSpec, SegmentFill};
use crate::config::ResolverConfig;
use crate::coordinator::{ClientError, CoordinatorApi, SecretOutcome};

#[derive(Error, Debug)]
pub enum SwapError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error("no driver configured for chain {0}")]
    NoDriver(String),
    #[error("escrow creation returned no address")]
    MissingEscrowAddress,
    #[error("secret not released after {attempts} attempts")]
    SecretUnavailable { attempts: u32 },
    #[error("cancellation window not open until {opens_at}")]
    CancellationNotOpen { opens_at: u64 },
}

pub struct SwapOrchestrator {
    config: ResolverConfig,
    coordinator: Arc<dyn CoordinatorApi>,
    drivers: HashMap<String, Arc<dyn ChainDriver>>,
}

impl SwapOrchestrator {
    pub fn new(
        config: ResolverConfig,
        coordinator: Arc<dyn CoordinatorApi>,
        drivers: HashMap<String, Arc<dyn ChainDriver>>,
    ) -> Self {
        SwapOrchestrator {
            config,
            coordinator,
            drivers,
        }
    }

    fn driver(&self, chain: &str) -> Result<&Arc<dyn ChainDriver>, SwapError> {
        self.drivers
            .get(chain)
            .ok_or_else(|| SwapError::NoDriver(chain.to_string()))
    }

    /// Execute a won order (or one won segment of it) end to end.
    pub async fn execute(&self, order_id: &str, segment_id: Option<u8>) -> Result<(), SwapError> {
        let order = self.coordinator.get_order(order_id).await?;
        let src = Arc::clone(self.driver(&order.src_chain)?);
        let dst = Arc::clone(self.driver(&order.dst_chain)?);

        let src_amount = order.scope_amount(segment_id)?;
        let dst_amount = match segment_id {
            Some(id) => segment_amounts(order.dst_amount)[id as usize - 1],
            None => order.dst_amount,
        };
        let segment = segment_id.map(|id| SegmentFill {
            segment_id: id,
            total_segments: SEGMENT_COUNT,
        });

        // Both escrows share one set of windows, anchored now.
        let timelocks = self.config.timelocks.at(Utc::now().timestamp() as u64)?;
        info!(
            order_id,
            ?segment_id,
            src_chain = %order.src_chain,
            dst_chain = %order.dst_chain,
            "starting swap execution"
        );

        // Prepare src: spending rights for the escrow factory.
        src.approve(&order.src_token, src_amount).await?;
        self.notify(order_id, "prepared_src", serde_json::json!({}), segment_id)
            .await?;

        // Src escrow: the resolver is the recipient, the buyer the
        // refund address.
        let src_outcome = src
            .invoke(&EscrowAction::Create(EscrowSpec {
                side: EscrowSide::Src,
                hash_lock: order.hash_lock.0,
                recipient: src.account().to_string(),
                buyer: Some(order.buyer_src_address.clone()),
                token: order.src_token.clone(),
                amount: src_amount,
                timelocks,
                segment,
            }))
            .await?;
        let src_escrow = src_outcome
            .escrow_address
            .clone()
            .ok_or(SwapError::MissingEscrowAddress)?;
        self.notify(
            order_id,
            "src_escrow_created",
            serde_json::json!({"address": src_escrow, "txHash": src_outcome.tx_hash}),
            segment_id,
        )
        .await?;

        // Dst escrow: payout recipient is the buyer, same hashlock and
        // windows.
        dst.approve(&order.dst_token, dst_amount).await?;
        let dst_outcome = dst
            .invoke(&EscrowAction::Create(EscrowSpec {
                side: EscrowSide::Dst,
                hash_lock: order.hash_lock.0,
                recipient: order.buyer_dst_address.clone(),
                buyer: None,
                token: order.dst_token.clone(),
                amount: dst_amount,
                timelocks,
                segment,
            }))
            .await?;
        let dst_escrow = dst_outcome
            .escrow_address
            .clone()
            .ok_or(SwapError::MissingEscrowAddress)?;
        self.notify(
            order_id,
            "dst_escrow_created",
            serde_json::json!({"address": dst_escrow, "txHash": dst_outcome.tx_hash}),
            segment_id,
        )
        .await?;

        // Verification gate: the coordinator checks both chains before
        // the vault lets go of the secret.
        self.notify(
            order_id,
            "awaiting_verification",
            serde_json::json!({"srcEscrow": src_escrow, "dstEscrow": dst_escrow}),
            segment_id,
        )
        .await?;
        let (secret, merkle_proof) = self
            .obtain_secret(order_id, segment_id, &order, &src_escrow, &dst_escrow)
            .await?;
        self.notify(order_id, "secret_received", serde_json::json!({}), segment_id)
            .await?;

        // Withdrawals open at withdrawal_start on both sides.
        wait_for_window(timelocks).await;

        let src_withdrawal = src
            .invoke(&EscrowAction::Withdraw {
                escrow_address: src_escrow,
                secret,
                proof: merkle_proof.clone(),
            })
            .await?;
        self.notify(
            order_id,
            "src_withdrawn",
            serde_json::json!({"txHash": src_withdrawal.tx_hash}),
            segment_id,
        )
        .await?;

        let dst_withdrawal = dst
            .invoke(&EscrowAction::Withdraw {
                escrow_address: dst_escrow,
                secret,
                proof: merkle_proof,
            })
            .await?;
        self.notify(
            order_id,
            "dst_withdrawn",
            serde_json::json!({"txHash": dst_withdrawal.tx_hash}),
            segment_id,
        )
        .await?;

        self.notify(order_id, "completed", serde_json::json!({}), segment_id)
            .await?;
        info!(order_id, ?segment_id, "swap completed");
        Ok(())
    }

    /// Reclaim both escrows of an abandoned swap once the cancellation
    /// window opens. The windows are re-derived from the escrow
    /// creation times the coordinator has on record; the on-chain
    /// contracts enforce them regardless.
    pub async fn cancel(
        &self,
        order_id: &str,
        segment_id: Option<u8>,
        src_escrow: &str,
        dst_escrow: &str,
    ) -> Result<(), SwapError> {
        let order = self.coordinator.get_order(order_id).await?;
        let src = Arc::clone(self.driver(&order.src_chain)?);
        let dst = Arc::clone(self.driver(&order.dst_chain)?);

        let now = Utc::now().timestamp() as u64;
        for address in [src_escrow, dst_escrow] {
            let created_at = order
                .escrow_records
                .iter()
                .find(|record| record.address == address)
                .map(|record| record.created_at.timestamp() as u64);
            if let Some(created_at) = created_at {
                let windows = self.config.timelocks.at(created_at)?;
                if !windows.may_cancel(now, true) {
                    return Err(SwapError::CancellationNotOpen {
                        opens_at: windows.cancellation_start,
                    });
                }
            }
        }

        let src_outcome = src
            .invoke(&EscrowAction::Cancel {
                escrow_address: src_escrow.to_string(),
            })
            .await?;
        let dst_outcome = dst
            .invoke(&EscrowAction::Cancel {
                escrow_address: dst_escrow.to_string(),
            })
            .await?;
        self.notify(
            order_id,
            "cancelled",
            serde_json::json!({
                "srcTxHash": src_outcome.tx_hash,
                "dstTxHash": dst_outcome.tx_hash,
            }),
            segment_id,
        )
        .await?;
        info!(order_id, ?segment_id, "escrow pair cancelled");
        Ok(())
    }

    async fn obtain_secret(
        &self,
        order_id: &str,
        segment_id: Option<u8>,
        order: &Order,
        src_escrow: &str,
        dst_escrow: &str,
    ) -> Result<(hashlock::Bytes32, Option<Vec<hashlock::Bytes32>>), SwapError> {
        let request = RequestSecretRequest {
            segment_id,
            src_escrow_address: src_escrow.to_string(),
            dst_escrow_address: dst_escrow.to_string(),
            source_chain: order.src_chain.clone(),
            destination_chain: order.dst_chain.clone(),
            resolver_id: self.config.resolver_id.clone(),
        };

        let mut attempts = 0;
        loop {
            match self.coordinator.request_secret(order_id, &request).await? {
                SecretOutcome::Released {
                    secret,
                    merkle_proof,
                } => return Ok((secret, merkle_proof)),
                SecretOutcome::Pending(reason) => {
                    attempts += 1;
                    if attempts >= self.config.strategy.secret_max_retries {
                        return Err(SwapError::SecretUnavailable { attempts });
                    }
                    warn!(
                        order_id,
                        attempts, "secret still pending ({}), retrying", reason
                    );
                    tokio::time::sleep(Duration::from_secs(self.config.strategy.secret_retry_secs))
                        .await;
                }
            }
        }
    }

    async fn notify(
        &self,
        order_id: &str,
        step: &str,
        details: serde_json::Value,
        segment_id: Option<u8>,
    ) -> Result<(), SwapError> {
        self.coordinator
            .notify_progress(
                order_id,
                &ProgressRequest {
                    step: step.to_string(),
                    details,
                    segment_id,
                    resolver_id: Some(self.config.resolver_id.clone()),
                },
            )
            .await?;
        Ok(())
    }
}

/// Sleep until the withdrawal window opens. Wall clocks on both chains
/// are assumed synchronized within one block time of the slower chain,
/// which the configured window offsets must already absorb.
async fn wait_for_window(timelocks: Timelocks) {
    let now = Utc::now().timestamp() as u64;
    if timelocks.withdrawal_start > now {
        let wait = timelocks.withdrawal_start - now;
        info!("waiting {}s for the withdrawal window", wait);
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }
}
