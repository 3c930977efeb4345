//! EVM chain driver.
//!
//! Write operations go through the foundry `cast` CLI, which holds the
//! signing account; read-side observation goes straight to JSON-RPC.
//! Native value is wrapped (deposit-then-approve) before escrow
//! funding when the order's token is the chain's wrapped-native token.

use async_trait::async_trait;
use chrono::Utc;
use swap_protocols::EscrowSide;
use tracing::{debug, info};

use crate::chain::{
    AccountEffect, ChainDriver, ChainError, EscrowAction, ObservedTransfer, TxOutcome,
};
use crate::config::ChainDriverConfig;

/// keccak256("Transfer(address,address,uint256)").
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// Block range scanned when observing inbound transfers.
const SCAN_BLOCKS: u64 = 300;

pub struct EvmDriver {
    chain_id: String,
    config: ChainDriverConfig,
    client: reqwest::Client,
    dry_run: bool,
}

impl EvmDriver {
    pub fn new(chain_id: &str, config: ChainDriverConfig, dry_run: bool) -> Self {
        EvmDriver {
            chain_id: chain_id.to_string(),
            config,
            client: reqwest::Client::new(),
            dry_run,
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--rpc-url".to_string(),
            self.config.rpc_url.clone(),
            "--from".to_string(),
            self.config.account.clone(),
            "--json".to_string(),
        ]
    }

    async fn cast_send(&self, mut call: Vec<String>) -> Result<serde_json::Value, ChainError> {
        let mut args = vec!["send".to_string()];
        args.append(&mut call);
        args.extend(self.base_args());

        if self.dry_run {
            info!("dry-run: cast {}", args.join(" "));
            return Ok(serde_json::json!({
                "transactionHash": format!("dry-run-{}", Utc::now().timestamp_micros()),
                "logs": [{"address": "0xdry-run-escrow"}],
            }));
        }

        debug!("cast {}", args.join(" "));
        let output = tokio::process::Command::new("cast")
            .args(&args)
            .output()
            .await
            .map_err(|e| ChainError::Command(format!("failed to spawn cast: {}", e)))?;
        if !output.status.success() {
            return Err(ChainError::Command(format!(
                "cast send failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| ChainError::Malformed(format!("cast receipt: {}", e)))
    }

    fn outcome_from_receipt(receipt: &serde_json::Value, expect_escrow: bool) -> TxOutcome {
        let tx_hash = receipt
            .get("transactionHash")
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_string();
        // The factory's creation event is emitted by the new escrow,
        // so its address rides on the first receipt log.
        let escrow_address = if expect_escrow {
            receipt
                .pointer("/logs/0/address")
                .and_then(|a| a.as_str())
                .map(|a| a.to_string())
        } else {
            None
        };
        TxOutcome {
            tx_hash,
            escrow_address,
        }
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChainError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        if let Some(error) = value.get("error") {
            return Err(ChainError::Rpc(format!("{}: {}", method, error)));
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::Malformed(format!("{} returned no result", method)))
    }
}

/// Render escrow actions as cast call fragments: `[target, signature,
/// arg...]`. Split out for testability.
pub fn render_action(
    factory: &str,
    action: &EscrowAction,
) -> Result<Vec<String>, ChainError> {
    match action {
        EscrowAction::Create(spec) => {
            let segment = spec.segment.as_ref();
            let (segment_id, total_segments) =
                segment.map(|s| (s.segment_id, s.total_segments)).unwrap_or((0, 1));
            match spec.side {
                EscrowSide::Src => {
                    let buyer = spec.buyer.as_deref().ok_or_else(|| {
                        ChainError::Command("src escrow needs a buyer refund address".to_string())
                    })?;
                    Ok(vec![
                        factory.to_string(),
                        "createSrcEscrow(bytes32,address,address,address,uint256,uint256,uint256,uint256,uint256,uint256,uint256)".to_string(),
                        format!("0x{}", hex::encode(spec.hash_lock)),
                        spec.token.clone(),
                        spec.recipient.clone(),
                        buyer.to_string(),
                        spec.amount.to_string(),
                        spec.timelocks.withdrawal_start.to_string(),
                        spec.timelocks.public_withdrawal_start.to_string(),
                        spec.timelocks.cancellation_start.to_string(),
                        spec.timelocks.public_cancellation_start.to_string(),
                        segment_id.to_string(),
                        total_segments.to_string(),
                    ])
                }
                EscrowSide::Dst => Ok(vec![
                    factory.to_string(),
                    "createDstEscrow(bytes32,address,address,uint256,uint256,uint256,uint256,uint256,uint256)".to_string(),
                    format!("0x{}", hex::encode(spec.hash_lock)),
                    spec.token.clone(),
                    spec.recipient.clone(),
                    spec.amount.to_string(),
                    spec.timelocks.withdrawal_start.to_string(),
                    spec.timelocks.public_withdrawal_start.to_string(),
                    spec.timelocks.cancellation_start.to_string(),
                    segment_id.to_string(),
                    total_segments.to_string(),
                ]),
            }
        }
        EscrowAction::Withdraw {
            escrow_address,
            secret,
            proof,
        } => match proof {
            None => Ok(vec![
                escrow_address.clone(),
                "withdraw(bytes32)".to_string(),
                format!("0x{}", hex::encode(secret)),
            ]),
            Some(proof) => {
                let elements: Vec<String> =
                    proof.iter().map(|p| format!("0x{}", hex::encode(p))).collect();
                Ok(vec![
                    escrow_address.clone(),
                    "withdrawWithProof(bytes32,bytes32[])".to_string(),
                    format!("0x{}", hex::encode(secret)),
                    format!("[{}]", elements.join(",")),
                ])
            }
        },
        EscrowAction::Cancel { escrow_address } => Ok(vec![
            escrow_address.clone(),
            "cancel()".to_string(),
        ]),
    }
}

#[async_trait]
impl ChainDriver for EvmDriver {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn account(&self) -> &str {
        &self.config.account
    }

    async fn approve(&self, token: &str, amount: u128) -> Result<TxOutcome, ChainError> {
        // Wrapped-native funding: deposit first, then approve the
        // wrapped balance to the factory.
        if self.config.wrapped_native.as_deref() == Some(token) {
            let wrap = vec![
                token.to_string(),
                "deposit()".to_string(),
                "--value".to_string(),
                amount.to_string(),
            ];
            self.cast_send(wrap).await?;
        }
        let receipt = self
            .cast_send(vec![
                token.to_string(),
                "approve(address,uint256)".to_string(),
                self.config.escrow_factory.clone(),
                amount.to_string(),
            ])
            .await?;
        Ok(Self::outcome_from_receipt(&receipt, false))
    }

    async fn transfer(
        &self,
        token: &str,
        to: &str,
        amount: u128,
    ) -> Result<TxOutcome, ChainError> {
        let receipt = self
            .cast_send(vec![
                token.to_string(),
                "transfer(address,uint256)".to_string(),
                to.to_string(),
                amount.to_string(),
            ])
            .await?;
        Ok(Self::outcome_from_receipt(&receipt, false))
    }

    async fn invoke(&self, action: &EscrowAction) -> Result<TxOutcome, ChainError> {
        let call = render_action(&self.config.escrow_factory, action)?;
        let expect_escrow = matches!(action, EscrowAction::Create(_));
        let receipt = self.cast_send(call).await?;
        Ok(Self::outcome_from_receipt(&receipt, expect_escrow))
    }

    async fn observe_transfer_to(
        &self,
        address: &str,
    ) -> Result<Vec<ObservedTransfer>, ChainError> {
        let latest = self.rpc_call("eth_blockNumber", serde_json::json!([])).await?;
        let latest = latest
            .as_str()
            .and_then(|raw| u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok())
            .ok_or_else(|| ChainError::Malformed("block number".to_string()))?;
        let from_block = latest.saturating_sub(SCAN_BLOCKS);

        let stripped = address.strip_prefix("0x").unwrap_or(address).to_lowercase();
        let params = serde_json::json!([{
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": "latest",
            "topics": [TRANSFER_TOPIC, serde_json::Value::Null, format!("0x{:0>64}", stripped)],
        }]);
        let logs = self.rpc_call("eth_getLogs", params).await?;
        let logs = logs
            .as_array()
            .ok_or_else(|| ChainError::Malformed("eth_getLogs response".to_string()))?;

        let mut transfers = Vec::new();
        for log in logs.iter().rev() {
            let amount = log
                .get("data")
                .and_then(|d| d.as_str())
                .map(|d| d.trim_start_matches("0x").trim_start_matches('0'))
                .and_then(|d| {
                    if d.is_empty() {
                        Some(0)
                    } else {
                        u128::from_str_radix(d, 16).ok()
                    }
                });
            let Some(amount) = amount else { continue };
            transfers.push(ObservedTransfer {
                tx_hash: log
                    .get("transactionHash")
                    .and_then(|h| h.as_str())
                    .unwrap_or_default()
                    .to_string(),
                amount,
            });
        }
        Ok(transfers)
    }

    async fn observe_account_effects(
        &self,
        _address: &str,
    ) -> Result<Vec<AccountEffect>, ChainError> {
        Err(ChainError::Unsupported(
            "EVM chains expose transfer logs, not account effects".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swap_protocols::Timelocks;

    fn spec(side: EscrowSide) -> crate::chain::EscrowSpec {
        crate::chain::EscrowSpec {
            side,
            hash_lock: [0xab; 32],
            recipient: "0xresolver".into(),
            buyer: Some("0xbuyer".into()),
            token: "0xtoken".into(),
            amount: 1_000,
            timelocks: Timelocks {
                withdrawal_start: 100,
                public_withdrawal_start: 200,
                cancellation_start: 300,
                public_cancellation_start: 400,
            },
            segment: None,
        }
    }

    #[test]
    fn test_render_src_escrow_creation() {
        let call = render_action("0xfactory", &EscrowAction::Create(spec(EscrowSide::Src))).unwrap();
        assert_eq!(call[0], "0xfactory");
        assert!(call[1].starts_with("createSrcEscrow("));
        // hashLock, token, recipient, buyer, amount, four windows,
        // segment id and total: a full-fill default of 0 of 1.
        assert_eq!(call.len(), 13);
        assert_eq!(call[2], format!("0x{}", "ab".repeat(32)));
        assert_eq!(call[11], "0");
        assert_eq!(call[12], "1");
    }

    #[test]
    fn test_render_dst_escrow_has_no_public_cancellation() {
        let call = render_action("0xfactory", &EscrowAction::Create(spec(EscrowSide::Dst))).unwrap();
        assert!(call[1].starts_with("createDstEscrow("));
        // Three windows on the destination side.
        assert!(!call.contains(&"400".to_string()));
        assert!(call.contains(&"300".to_string()));
    }

    #[test]
    fn test_render_withdraw_with_proof() {
        let call = render_action(
            "0xfactory",
            &EscrowAction::Withdraw {
                escrow_address: "0xescrow".into(),
                secret: [1u8; 32],
                proof: Some(vec![[2u8; 32], [3u8; 32]]),
            },
        )
        .unwrap();
        assert_eq!(call[0], "0xescrow");
        assert_eq!(call[1], "withdrawWithProof(bytes32,bytes32[])");
        assert!(call[3].starts_with('['));
        assert!(call[3].contains(&"02".repeat(32)));
    }

    #[test]
    fn test_src_escrow_requires_buyer() {
        let mut missing_buyer = spec(EscrowSide::Src);
        missing_buyer.buyer = None;
        assert!(render_action("0xfactory", &EscrowAction::Create(missing_buyer)).is_err());
    }
}
