//! Event-bus wire schema: the tagged outbound message union and the
//! inbound client frames.
//!
//! Discriminants ride in a `type` field. Unknown tags fail
//! deserialization, and the bus answers them with an error frame
//! rather than dropping them silently.

use chrono::{DateTime, Utc};
use hashlock::HexBytes32;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AuctionPhase, OrderKind, ResolverId, SegmentStatus};

/// Outbound bus message. Every variant carries the order scope and a
/// publication timestamp alongside its typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    #[serde(rename_all = "camelCase")]
    AuctionOpened {
        order_id: String,
        ts: DateTime<Utc>,
        payload: AuctionOpenedPayload,
    },
    #[serde(rename_all = "camelCase")]
    PriceTick {
        order_id: String,
        ts: DateTime<Utc>,
        payload: PriceTickPayload,
    },
    #[serde(rename_all = "camelCase")]
    SegmentTick {
        order_id: String,
        segment_id: u8,
        ts: DateTime<Utc>,
        payload: PriceTickPayload,
    },
    #[serde(rename_all = "camelCase")]
    WinnerDeclared {
        order_id: String,
        ts: DateTime<Utc>,
        payload: WinnerPayload,
    },
    #[serde(rename_all = "camelCase")]
    SegmentWinnerDeclared {
        order_id: String,
        segment_id: u8,
        ts: DateTime<Utc>,
        payload: WinnerPayload,
    },
    #[serde(rename_all = "camelCase")]
    AuctionClosed {
        order_id: String,
        ts: DateTime<Utc>,
        payload: AuctionClosedPayload,
    },
    #[serde(rename_all = "camelCase")]
    ResolverProgress {
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_id: Option<u8>,
        ts: DateTime<Utc>,
        payload: ResolverProgressPayload,
    },
    #[serde(rename_all = "camelCase")]
    EscrowCreated {
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_id: Option<u8>,
        ts: DateTime<Utc>,
        payload: EscrowCreatedPayload,
    },
    #[serde(rename_all = "camelCase")]
    WithdrawalCompleted {
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_id: Option<u8>,
        ts: DateTime<Utc>,
        payload: WithdrawalPayload,
    },
    #[serde(rename_all = "camelCase")]
    SecretReleased {
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_id: Option<u8>,
        ts: DateTime<Utc>,
        payload: SecretReleasedPayload,
    },
}

impl BusMessage {
    /// The order this message belongs to. Per-order publication order
    /// is preserved by the bus.
    pub fn order_id(&self) -> &str {
        match self {
            BusMessage::AuctionOpened { order_id, .. }
            | BusMessage::PriceTick { order_id, .. }
            | BusMessage::SegmentTick { order_id, .. }
            | BusMessage::WinnerDeclared { order_id, .. }
            | BusMessage::SegmentWinnerDeclared { order_id, .. }
            | BusMessage::AuctionClosed { order_id, .. }
            | BusMessage::ResolverProgress { order_id, .. }
            | BusMessage::EscrowCreated { order_id, .. }
            | BusMessage::WithdrawalCompleted { order_id, .. }
            | BusMessage::SecretReleased { order_id, .. } => order_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionOpenedPayload {
    pub kind: OrderKind,
    pub start_price: Decimal,
    pub end_price: Decimal,
    /// Per-segment starting prices for segmented auctions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_start_prices: Option<Vec<Decimal>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTickPayload {
    pub current_price: Decimal,
    pub tick_count: u32,
    pub floor_reached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerPayload {
    pub resolver_id: ResolverId,
    pub winning_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionClosedPayload {
    pub phase: AuctionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverProgressPayload {
    pub resolver_id: ResolverId,
    pub step: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowCreatedPayload {
    pub side: crate::EscrowSide,
    pub address: String,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalPayload {
    pub side: crate::EscrowSide,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReleasedPayload {
    pub released_to: ResolverId,
}

/// Inbound frames a connected participant may send over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Identify the connection. Resolvers supply their id so claims
    /// and progress can be attributed.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        resolver_id: Option<ResolverId>,
    },
    /// Ask for the active-auction set, e.g. after a reconnect.
    SnapshotRequest {},
    /// Claim an order (or one segment of it) at the current price.
    #[serde(rename_all = "camelCase")]
    Claim {
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_id: Option<u8>,
        resolver_id: ResolverId,
    },
}

/// Snapshot of one active auction, sent in reply to `snapshot_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAuctionSummary {
    pub order_id: String,
    pub kind: OrderKind,
    pub end_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<Decimal>,
    #[serde(default)]
    pub segments: Vec<SegmentSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSummary {
    pub segment_id: u8,
    pub current_price: Decimal,
    pub status: SegmentStatus,
    pub leaf_hash: HexBytes32,
}

/// Frames the bus sends that are not auction events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledges a subscription.
    #[serde(rename_all = "camelCase")]
    Subscribed { subscriber_id: String },
    /// Reply to `snapshot_request`.
    #[serde(rename_all = "camelCase")]
    Snapshot { auctions: Vec<ActiveAuctionSummary> },
    /// Claim verdict; rejected claims carry the error code.
    #[serde(rename_all = "camelCase")]
    ClaimResult {
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_id: Option<u8>,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        winning_price: Option<Decimal>,
    },
    /// Sent for malformed or unknown inbound frames.
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bus_message_wire_shape() {
        let message = BusMessage::PriceTick {
            order_id: "ord-1".into(),
            ts: Utc::now(),
            payload: PriceTickPayload {
                current_price: dec!(4446),
                tick_count: 1,
                floor_reached: false,
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "price_tick");
        assert_eq!(value["orderId"], "ord-1");
        assert_eq!(value["payload"]["tickCount"], 1);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let raw = r#"{"type":"mystery_event","orderId":"ord-1"}"#;
        assert!(serde_json::from_str::<BusMessage>(raw).is_err());
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }

    #[test]
    fn test_claim_frame_round_trip() {
        let raw = r#"{"type":"claim","orderId":"ord-9","segmentId":2,"resolverId":"res-a"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Claim { order_id, segment_id, resolver_id } => {
                assert_eq!(order_id, "ord-9");
                assert_eq!(segment_id, Some(2));
                assert_eq!(resolver_id, "res-a");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
