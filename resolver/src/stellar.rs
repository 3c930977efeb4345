//! Stellar/Soroban chain driver.
//!
//! Write operations go through the `stellar` CLI, which holds the
//! signing identity; read-side observation uses Horizon. Soroban token
//! allowances carry an expiration ledger, which is the chain's version
//! of the dual token/contract allowance requirement.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use swap_protocols::EscrowSide;
use tracing::{debug, info};

use crate::chain::{
    AccountEffect, ChainDriver, ChainError, EscrowAction, ObservedTransfer, TxOutcome,
};
use crate::config::ChainDriverConfig;

/// Decimal places of Stellar asset amounts on Horizon.
const STELLAR_DECIMALS: u32 = 7;
/// Allowance validity horizon, in ledgers.
const ALLOWANCE_LEDGERS: u64 = 200_000;

pub struct StellarDriver {
    chain_id: String,
    config: ChainDriverConfig,
    client: reqwest::Client,
    dry_run: bool,
}

impl StellarDriver {
    pub fn new(chain_id: &str, config: ChainDriverConfig, dry_run: bool) -> Self {
        StellarDriver {
            chain_id: chain_id.to_string(),
            config,
            client: reqwest::Client::new(),
            dry_run,
        }
    }

    async fn invoke_contract(
        &self,
        contract: &str,
        call: Vec<String>,
    ) -> Result<String, ChainError> {
        let mut args = vec![
            "contract".to_string(),
            "invoke".to_string(),
            "--id".to_string(),
            contract.to_string(),
            "--source-account".to_string(),
            self.config.account.clone(),
            "--network".to_string(),
            self.config.network.clone(),
            "--".to_string(),
        ];
        args.extend(call);

        if self.dry_run {
            info!("dry-run: stellar {}", args.join(" "));
            return Ok(format!("dry-run-{}", Utc::now().timestamp_micros()));
        }

        debug!("stellar {}", args.join(" "));
        let output = tokio::process::Command::new("stellar")
            .args(&args)
            .output()
            .await
            .map_err(|e| ChainError::Command(format!("failed to spawn stellar cli: {}", e)))?;
        if !output.status.success() {
            return Err(ChainError::Command(format!(
                "stellar invoke failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        // The CLI prints the invocation's return value on stdout.
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string())
    }

    async fn horizon_get(&self, path: &str) -> Result<serde_json::Value, ChainError> {
        let url = format!("{}{}", self.config.rpc_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChainError::Rpc(format!(
                "horizon returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(e.to_string()))
    }
}

/// Render escrow actions as Soroban invoke arguments. Split out for
/// testability.
pub fn render_action(action: &EscrowAction) -> Result<(Option<String>, Vec<String>), ChainError> {
    match action {
        EscrowAction::Create(spec) => {
            let (segment_id, total_segments) = spec
                .segment
                .as_ref()
                .map(|s| (s.segment_id, s.total_segments))
                .unwrap_or((0, 1));
            let mut call = match spec.side {
                EscrowSide::Src => {
                    let buyer = spec.buyer.as_deref().ok_or_else(|| {
                        ChainError::Command("src escrow needs a buyer refund address".to_string())
                    })?;
                    vec![
                        "create_src_escrow".to_string(),
                        "--hash-lock".to_string(),
                        hex::encode(spec.hash_lock),
                        "--recipient".to_string(),
                        spec.recipient.clone(),
                        "--buyer".to_string(),
                        buyer.to_string(),
                    ]
                }
                EscrowSide::Dst => vec![
                    "create_dst_escrow".to_string(),
                    "--hash-lock".to_string(),
                    hex::encode(spec.hash_lock),
                    "--recipient".to_string(),
                    spec.recipient.clone(),
                ],
            };
            call.extend([
                "--token".to_string(),
                spec.token.clone(),
                "--amount".to_string(),
                spec.amount.to_string(),
                "--withdrawal-start".to_string(),
                spec.timelocks.withdrawal_start.to_string(),
                "--public-withdrawal-start".to_string(),
                spec.timelocks.public_withdrawal_start.to_string(),
                "--cancellation-start".to_string(),
                spec.timelocks.cancellation_start.to_string(),
            ]);
            if spec.side == EscrowSide::Src {
                call.extend([
                    "--public-cancellation-start".to_string(),
                    spec.timelocks.public_cancellation_start.to_string(),
                ]);
            }
            call.extend([
                "--segment-id".to_string(),
                segment_id.to_string(),
                "--total-segments".to_string(),
                total_segments.to_string(),
            ]);
            Ok((None, call))
        }
        // The factory contract manages its escrows, so withdrawals and
        // cancellations are invoked on the factory with the escrow
        // address as an argument.
        EscrowAction::Withdraw {
            escrow_address,
            secret,
            proof,
        } => {
            let mut call = vec![
                "withdraw".to_string(),
                "--escrow".to_string(),
                escrow_address.clone(),
                "--secret".to_string(),
                hex::encode(secret),
            ];
            if let Some(proof) = proof {
                let elements: Vec<String> = proof.iter().map(hex::encode).collect();
                call[0] = "withdraw_with_proof".to_string();
                call.extend(["--proof".to_string(), format!("[{}]", elements.join(","))]);
            }
            Ok((None, call))
        }
        EscrowAction::Cancel { escrow_address } => Ok((
            None,
            vec![
                "cancel".to_string(),
                "--escrow".to_string(),
                escrow_address.clone(),
            ],
        )),
    }
}

#[async_trait]
impl ChainDriver for StellarDriver {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn account(&self) -> &str {
        &self.config.account
    }

    async fn approve(&self, token: &str, amount: u128) -> Result<TxOutcome, ChainError> {
        let call = vec![
            "approve".to_string(),
            "--from".to_string(),
            self.config.account.clone(),
            "--spender".to_string(),
            self.config.escrow_factory.clone(),
            "--amount".to_string(),
            amount.to_string(),
            "--expiration-ledger".to_string(),
            ALLOWANCE_LEDGERS.to_string(),
        ];
        let result = self.invoke_contract(token, call).await?;
        Ok(TxOutcome {
            tx_hash: result,
            escrow_address: None,
        })
    }

    async fn transfer(
        &self,
        token: &str,
        to: &str,
        amount: u128,
    ) -> Result<TxOutcome, ChainError> {
        let call = vec![
            "transfer".to_string(),
            "--from".to_string(),
            self.config.account.clone(),
            "--to".to_string(),
            to.to_string(),
            "--amount".to_string(),
            amount.to_string(),
        ];
        let result = self.invoke_contract(token, call).await?;
        Ok(TxOutcome {
            tx_hash: result,
            escrow_address: None,
        })
    }

    async fn invoke(&self, action: &EscrowAction) -> Result<TxOutcome, ChainError> {
        let (target, call) = render_action(action)?;
        let contract = target.unwrap_or_else(|| self.config.escrow_factory.clone());
        let result = self.invoke_contract(&contract, call).await?;
        // Creation invocations return the new escrow contract address.
        let escrow_address = match action {
            EscrowAction::Create(_) => Some(result.clone()),
            _ => None,
        };
        Ok(TxOutcome {
            tx_hash: result,
            escrow_address,
        })
    }

    async fn observe_transfer_to(
        &self,
        address: &str,
    ) -> Result<Vec<ObservedTransfer>, ChainError> {
        let value = self
            .horizon_get(&format!("/accounts/{}/payments?order=desc&limit=10", address))
            .await?;
        let records = value
            .pointer("/_embedded/records")
            .and_then(|r| r.as_array())
            .ok_or_else(|| ChainError::Malformed("horizon payments".to_string()))?;

        let mut transfers = Vec::new();
        for record in records {
            if record.get("to").and_then(|t| t.as_str()) != Some(address) {
                continue;
            }
            let Some(amount) = record
                .get("amount")
                .and_then(|a| a.as_str())
                .and_then(|a| a.parse::<Decimal>().ok())
                .and_then(stellar_minor_units)
            else {
                continue;
            };
            transfers.push(ObservedTransfer {
                tx_hash: record
                    .get("transaction_hash")
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
        address: &str,
    ) -> Result<Vec<AccountEffect>, ChainError> {
        let value = self
            .horizon_get(&format!("/accounts/{}/effects?order=desc&limit=10", address))
            .await?;
        let records = value
            .pointer("/_embedded/records")
            .and_then(|r| r.as_array())
            .ok_or_else(|| ChainError::Malformed("horizon effects".to_string()))?;

        Ok(records
            .iter()
            .map(|record| AccountEffect {
                kind: record
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                amount: record
                    .get("amount")
                    .and_then(|a| a.as_str())
                    .and_then(|a| a.parse::<Decimal>().ok())
                    .and_then(stellar_minor_units),
            })
            .collect())
    }
}

fn stellar_minor_units(amount: Decimal) -> Option<u128> {
    (amount * Decimal::from(10u64.pow(STELLAR_DECIMALS)))
        .trunc()
        .to_u128()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::EscrowSpec;
    use swap_protocols::Timelocks;

    fn spec(side: EscrowSide) -> EscrowSpec {
        EscrowSpec {
            side,
            hash_lock: [0xcd; 32],
            recipient: "GRECIPIENT".into(),
            buyer: Some("GBUYER".into()),
            token: "CTOKEN".into(),
            amount: 9_750,
            timelocks: Timelocks {
                withdrawal_start: 100,
                public_withdrawal_start: 200,
                cancellation_start: 300,
                public_cancellation_start: 400,
            },
            segment: Some(crate::chain::SegmentFill {
                segment_id: 2,
                total_segments: 4,
            }),
        }
    }

    #[test]
    fn test_render_src_escrow_call() {
        let (target, call) = render_action(&EscrowAction::Create(spec(EscrowSide::Src))).unwrap();
        assert!(target.is_none());
        assert_eq!(call[0], "create_src_escrow");
        assert!(call.contains(&"--public-cancellation-start".to_string()));
        assert!(call.contains(&"--segment-id".to_string()));
        assert!(call.contains(&"2".to_string()));
    }

    #[test]
    fn test_render_dst_escrow_omits_public_cancellation() {
        let (_, call) = render_action(&EscrowAction::Create(spec(EscrowSide::Dst))).unwrap();
        assert_eq!(call[0], "create_dst_escrow");
        assert!(!call.contains(&"--public-cancellation-start".to_string()));
        assert!(!call.contains(&"--buyer".to_string()));
    }

    #[test]
    fn test_render_withdraw_goes_through_factory() {
        let (target, call) = render_action(&EscrowAction::Withdraw {
            escrow_address: "CESCROW".into(),
            secret: [9u8; 32],
            proof: Some(vec![[1u8; 32]]),
        })
        .unwrap();
        assert!(target.is_none());
        assert_eq!(call[0], "withdraw_with_proof");
        assert!(call.contains(&"--escrow".to_string()));
        assert!(call.contains(&"--proof".to_string()));
    }

    #[test]
    fn test_stellar_minor_units() {
        assert_eq!(stellar_minor_units("1.5".parse().unwrap()), Some(15_000_000));
    }
}
