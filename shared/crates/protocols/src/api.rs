//! Relayer API request and response bodies.

use hashlock::HexBytes32;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{OrderKind, OrderStatus};

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub kind: OrderKind,
    pub src_chain: String,
    pub dst_chain: String,
    pub src_token: String,
    pub dst_token: String,
    #[serde(with = "crate::amount")]
    pub src_amount: u128,
    #[serde(with = "crate::amount")]
    pub dst_amount: u128,
    pub market_price: Decimal,
    pub slippage: Decimal,
    pub buyer_src_address: String,
    pub buyer_dst_address: String,
    /// Buyer-supplied hashlock. When absent the coordinator mints the
    /// secret material itself and keeps it in the vault.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_lock: Option<HexBytes32>,
    /// Leaf set for buyer-supplied segmented hashlocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_leaf_hashes: Option<Vec<HexBytes32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Body of `POST /orders/{id}/secret`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSecretRequest {
    pub secret: HexBytes32,
    pub hash_lock: HexBytes32,
}

/// Body of `POST /orders/{id}/segment-secret`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSegmentSecretRequest {
    pub segment_id: u8,
    pub secret: HexBytes32,
    pub leaf_hash: HexBytes32,
}

/// Body of `POST /orders/{id}/request-secret`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSecretRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<u8>,
    pub src_escrow_address: String,
    pub dst_escrow_address: String,
    pub source_chain: String,
    pub destination_chain: String,
    pub resolver_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSecretResponse {
    pub secret: HexBytes32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_proof: Option<Vec<HexBytes32>>,
}

/// Body of `POST /orders/{id}/progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    pub step: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver_id: Option<String>,
}

/// Query parameters of `GET /orders`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_address: Option<String>,
}

/// Machine-readable error body. `order_status` lets a client re-drive
/// itself from the order's current position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_status: Option<OrderStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_create_order_request_wire_names() {
        let raw = r#"{
            "kind": "single",
            "srcChain": "evm-sepolia",
            "dstChain": "stellar-testnet",
            "srcToken": "ETH",
            "dstToken": "XLM",
            "srcAmount": 1,
            "dstAmount": 39000,
            "marketPrice": 3900,
            "slippage": 0.02,
            "buyerSrcAddress": "0xabc",
            "buyerDstAddress": "GDXYZ"
        }"#;
        let request: CreateOrderRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.kind, OrderKind::Single);
        assert_eq!(request.market_price, dec!(3900));
        assert!(request.hash_lock.is_none());
    }

    #[test]
    fn test_error_body_carries_status() {
        let body = ErrorBody {
            code: "invalid_transition".into(),
            message: "order is terminal".into(),
            order_status: Some(OrderStatus::Expired),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["orderStatus"], "expired");
    }
}
