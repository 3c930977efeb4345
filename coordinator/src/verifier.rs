//! Escrow verifier: pulls chain-side evidence that both escrows of a
//! pair are funded with the expected amount inside a freshness window.
//!
//! Evidence queries sit behind the [`EvidenceSource`] trait. The
//! production source routes by chain family: EVM chains are scanned
//! through JSON-RPC transfer logs filtered by recipient, Stellar
//! chains through Horizon account effects where the first effect must
//! be a credit of the expected amount. Transient RPC trouble is
//! retried with exponential backoff up to an overall deadline and then
//! surfaced as pending, so the caller can simply retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ChainEndpoint, ChainFamily, VerifierConfig};

/// keccak256("Transfer(address,address,uint256)"), the ERC-20 transfer
/// event signature.
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

#[derive(Error, Debug, Clone)]
pub enum VerifierError {
    #[error("verification pending: {reason}")]
    Pending { reason: String },
    #[error("verification failed: {reason}")]
    Failed { reason: String },
    #[error("unknown chain: {0}")]
    UnknownChain(String),
    #[error("transient chain error: {0}")]
    Transient(String),
    #[error("permanent chain error: {0}")]
    Permanent(String),
}

/// One observed credit to an escrow address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvidence {
    pub tx_hash: String,
    #[serde(with = "swap_protocols::amount")]
    pub amount: u128,
    pub observed_at: DateTime<Utc>,
}

/// Per-side verdict with the evidence that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEvidence {
    pub chain: String,
    pub address: String,
    #[serde(with = "swap_protocols::amount")]
    pub required_amount: u128,
    pub funded: bool,
    pub evidence: Option<TransferEvidence>,
    pub checked_at: DateTime<Utc>,
}

/// Composite verdict the vault consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub verified: bool,
    pub src: SideEvidence,
    pub dst: SideEvidence,
}

/// What to verify for one (order, segment?) scope.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub order_id: String,
    pub segment_id: Option<u8>,
    pub src_chain: String,
    pub dst_chain: String,
    pub src_escrow_address: String,
    pub dst_escrow_address: String,
    pub src_amount: u128,
    pub dst_amount: u128,
}

/// Source of recent inbound credits to an address, newest first.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    async fn transfers_to(
        &self,
        chain: &str,
        address: &str,
    ) -> Result<Vec<TransferEvidence>, VerifierError>;
}

/// The verifier: policy (freshness, deadlines, backoff) over an
/// evidence source.
pub struct EscrowVerifier {
    config: VerifierConfig,
    source: Arc<dyn EvidenceSource>,
}

impl EscrowVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        let source = Arc::new(RpcEvidenceSource::new(config.clone()));
        EscrowVerifier { config, source }
    }

    /// Inject a source, used by tests and rehearsal runs.
    pub fn with_source(config: VerifierConfig, source: Arc<dyn EvidenceSource>) -> Self {
        EscrowVerifier { config, source }
    }

    /// Verify both sides of an escrow pair. `Ok` means the evidence
    /// queries completed; the report's `verified` flag is the verdict.
    /// Transient chain trouble that outlives the overall deadline
    /// surfaces as [`VerifierError::Pending`], never as failure.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationReport, VerifierError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.overall_deadline_secs);
        let mut delay = Duration::from_millis(self.config.retry_base_ms);

        loop {
            match self.check_both(request).await {
                Ok(report) => {
                    if report.verified {
                        info!(
                            order_id = %request.order_id,
                            segment_id = ?request.segment_id,
                            "escrow pair verified"
                        );
                    } else {
                        debug!(
                            order_id = %request.order_id,
                            src_funded = report.src.funded,
                            dst_funded = report.dst.funded,
                            "escrow pair not yet funded"
                        );
                    }
                    return Ok(report);
                }
                Err(VerifierError::Transient(reason)) => {
                    if tokio::time::Instant::now() + delay >= deadline {
                        warn!(
                            order_id = %request.order_id,
                            "verification deadline exhausted: {}", reason
                        );
                        return Err(VerifierError::Pending { reason });
                    }
                    debug!("transient verification error, retrying in {:?}: {}", delay, reason);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn check_both(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationReport, VerifierError> {
        let (src, dst) = tokio::join!(
            self.check_side(&request.src_chain, &request.src_escrow_address, request.src_amount),
            self.check_side(&request.dst_chain, &request.dst_escrow_address, request.dst_amount),
        );
        let src = src?;
        let dst = dst?;
        Ok(VerificationReport {
            verified: src.funded && dst.funded,
            src,
            dst,
        })
    }

    async fn check_side(
        &self,
        chain: &str,
        address: &str,
        required_amount: u128,
    ) -> Result<SideEvidence, VerifierError> {
        let endpoint = self
            .config
            .chains
            .get(chain)
            .ok_or_else(|| VerifierError::UnknownChain(chain.to_string()))?;

        let per_call = Duration::from_secs(self.config.per_call_timeout_secs);
        let transfers = tokio::time::timeout(per_call, self.source.transfers_to(chain, address))
            .await
            .map_err(|_| VerifierError::Transient(format!("evidence query timed out for {}", chain)))??;

        let now = Utc::now();
        let freshness = chrono::Duration::seconds(endpoint.freshness_secs as i64);
        let evidence = transfers
            .into_iter()
            .find(|t| t.amount >= required_amount && now - t.observed_at <= freshness);

        Ok(SideEvidence {
            chain: chain.to_string(),
            address: address.to_string(),
            required_amount,
            funded: evidence.is_some(),
            evidence,
            checked_at: now,
        })
    }
}

/// Production evidence source: JSON-RPC for EVM chains, Horizon for
/// Stellar chains.
pub struct RpcEvidenceSource {
    config: VerifierConfig,
    client: reqwest::Client,
}

impl RpcEvidenceSource {
    pub fn new(config: VerifierConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.per_call_timeout_secs))
            .build()
            .expect("reqwest client");
        RpcEvidenceSource { config, client }
    }

    async fn evm_transfers(
        &self,
        endpoint: &ChainEndpoint,
        address: &str,
    ) -> Result<Vec<TransferEvidence>, VerifierError> {
        let latest = self
            .rpc_call(&endpoint.endpoint, "eth_blockNumber", serde_json::json!([]))
            .await?;
        let latest = parse_hex_u64(latest.as_str().unwrap_or_default())
            .ok_or_else(|| VerifierError::Permanent("malformed block number".to_string()))?;
        let from_block = latest.saturating_sub(endpoint.scan_blocks);

        let params = serde_json::json!([{
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": "latest",
            "topics": [TRANSFER_TOPIC, serde_json::Value::Null, recipient_topic(address)],
        }]);
        let logs = self
            .rpc_call(&endpoint.endpoint, "eth_getLogs", params)
            .await?;
        let logs = logs
            .as_array()
            .ok_or_else(|| VerifierError::Permanent("malformed eth_getLogs response".to_string()))?;

        let mut transfers = Vec::new();
        for log in logs.iter().rev() {
            let Some(amount) = log.get("data").and_then(|d| d.as_str()).and_then(parse_hex_u128)
            else {
                continue;
            };
            let tx_hash = log
                .get("transactionHash")
                .and_then(|h| h.as_str())
                .unwrap_or_default()
                .to_string();
            let observed_at = match log.get("blockNumber").and_then(|b| b.as_str()) {
                Some(block) => self.evm_block_time(&endpoint.endpoint, block).await?,
                None => Utc::now(),
            };
            transfers.push(TransferEvidence {
                tx_hash,
                amount,
                observed_at,
            });
        }
        Ok(transfers)
    }

    async fn evm_block_time(
        &self,
        endpoint: &str,
        block: &str,
    ) -> Result<DateTime<Utc>, VerifierError> {
        let result = self
            .rpc_call(endpoint, "eth_getBlockByNumber", serde_json::json!([block, false]))
            .await?;
        let timestamp = result
            .get("timestamp")
            .and_then(|t| t.as_str())
            .and_then(parse_hex_u64)
            .ok_or_else(|| VerifierError::Permanent("malformed block timestamp".to_string()))?;
        Utc.timestamp_opt(timestamp as i64, 0)
            .single()
            .ok_or_else(|| VerifierError::Permanent("block timestamp out of range".to_string()))
    }

    async fn rpc_call(
        &self,
        endpoint: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, VerifierError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(VerifierError::Transient(format!("{} returned {}", method, status)));
        }
        if !status.is_success() {
            return Err(VerifierError::Permanent(format!("{} returned {}", method, status)));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VerifierError::Permanent(format!("malformed rpc response: {}", e)))?;
        if let Some(error) = value.get("error") {
            return Err(VerifierError::Permanent(format!("{} error: {}", method, error)));
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| VerifierError::Permanent(format!("{} returned no result", method)))
    }

    async fn stellar_credits(
        &self,
        endpoint: &ChainEndpoint,
        address: &str,
    ) -> Result<Vec<TransferEvidence>, VerifierError> {
        let url = format!(
            "{}/accounts/{}/effects?order=desc&limit=10",
            endpoint.endpoint.trim_end_matches('/'),
            address
        );
        let response = self.client.get(&url).send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(VerifierError::Transient(format!("horizon returned {}", status)));
        }
        if status.as_u16() == 404 {
            // Account not created yet: not funded, not an error.
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(VerifierError::Permanent(format!("horizon returned {}", status)));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VerifierError::Permanent(format!("malformed horizon response: {}", e)))?;

        let records = value
            .pointer("/_embedded/records")
            .and_then(|r| r.as_array())
            .ok_or_else(|| VerifierError::Permanent("malformed horizon effects".to_string()))?;

        // Only the most recent effect counts: the funding credit must
        // be the first thing that happened to the escrow account.
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };
        if first.get("type").and_then(|t| t.as_str()) != Some("account_credited") {
            return Ok(Vec::new());
        }

        let amount = first
            .get("amount")
            .and_then(|a| a.as_str())
            .and_then(|a| a.parse::<Decimal>().ok())
            .and_then(|a| stellar_minor_units(a, endpoint.asset_decimals))
            .ok_or_else(|| VerifierError::Permanent("malformed horizon amount".to_string()))?;
        let observed_at = first
            .get("created_at")
            .and_then(|t| t.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| VerifierError::Permanent("malformed horizon timestamp".to_string()))?;
        let tx_hash = first
            .pointer("/id")
            .and_then(|i| i.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(vec![TransferEvidence {
            tx_hash,
            amount,
            observed_at,
        }])
    }
}

#[async_trait]
impl EvidenceSource for RpcEvidenceSource {
    async fn transfers_to(
        &self,
        chain: &str,
        address: &str,
    ) -> Result<Vec<TransferEvidence>, VerifierError> {
        let endpoint = self
            .config
            .chains
            .get(chain)
            .ok_or_else(|| VerifierError::UnknownChain(chain.to_string()))?;
        match endpoint.family {
            ChainFamily::Evm => self.evm_transfers(endpoint, address).await,
            ChainFamily::Stellar => self.stellar_credits(endpoint, address).await,
        }
    }
}

fn classify_reqwest(error: reqwest::Error) -> VerifierError {
    if error.is_timeout() || error.is_connect() {
        VerifierError::Transient(error.to_string())
    } else {
        VerifierError::Permanent(error.to_string())
    }
}

fn parse_hex_u64(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.strip_prefix("0x")?, 16).ok()
}

fn parse_hex_u128(raw: &str) -> Option<u128> {
    let digits = raw.strip_prefix("0x")?.trim_start_matches('0');
    if digits.is_empty() {
        return Some(0);
    }
    if digits.len() > 32 {
        // Larger than u128: saturate, any required amount is covered.
        return Some(u128::MAX);
    }
    u128::from_str_radix(digits, 16).ok()
}

/// Convert a Horizon decimal amount into integer minor units.
fn stellar_minor_units(amount: Decimal, decimals: u32) -> Option<u128> {
    let scaled = amount * Decimal::from(10u64.pow(decimals));
    scaled.trunc().to_u128()
}

/// Left-pad an EVM address into a 32-byte log topic.
fn recipient_topic(address: &str) -> String {
    let stripped = address.strip_prefix("0x").unwrap_or(address).to_lowercase();
    format!("0x{:0>64}", stripped)
}
