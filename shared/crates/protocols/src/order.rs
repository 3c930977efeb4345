//! Order, segment, and escrow records plus the status DAG that gates
//! every coordinator-side mutation.

use chrono::{DateTime, Utc};
use hashlock::HexBytes32;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{OrderError, ResolverId, SEGMENT_COUNT};

/// Fill mode of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// One escrow pair, hashlock = SHA-256(secret).
    Single,
    /// Four escrow pairs, hashlock = Merkle root over the leaf set.
    Segmented,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Single => write!(f, "single"),
            OrderKind::Segmented => write!(f, "segmented"),
        }
    }
}

/// Order lifecycle status. Transitions are restricted to the DAG
/// enforced by [`OrderStatus::can_transition_to`]; terminal statuses
/// accept no further writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    AuctionActive,
    WinnerDeclared,
    SrcEscrowCreated,
    DstEscrowCreated,
    SecretRequested,
    SrcWithdrawn,
    DstWithdrawn,
    Completed,
    Expired,
    Cancelled,
}

impl OrderStatus {
    /// Whether the status accepts no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Expired | OrderStatus::Cancelled
        )
    }

    /// The status DAG. Forward progress only; `Expired` is reachable
    /// while no escrow exists, `Cancelled` while withdrawals have not
    /// begun.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, AuctionActive) => true,
            (Pending, Cancelled) | (Pending, Expired) => true,
            (AuctionActive, WinnerDeclared) => true,
            (AuctionActive, Expired) | (AuctionActive, Cancelled) => true,
            (WinnerDeclared, SrcEscrowCreated) => true,
            (WinnerDeclared, Expired) | (WinnerDeclared, Cancelled) => true,
            (SrcEscrowCreated, DstEscrowCreated) => true,
            (SrcEscrowCreated, Cancelled) => true,
            (DstEscrowCreated, SecretRequested) => true,
            (DstEscrowCreated, Cancelled) => true,
            (SecretRequested, SrcWithdrawn) => true,
            (SrcWithdrawn, DstWithdrawn) => true,
            (DstWithdrawn, Completed) => true,
            _ => false,
        }
    }

    /// Validate a transition, surfacing the DAG violation as an error.
    pub fn ensure_transition(&self, next: OrderStatus) -> Result<(), OrderError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(OrderError::InvalidTransition { from: *self, to: next })
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::AuctionActive => "auction_active",
            OrderStatus::WinnerDeclared => "winner_declared",
            OrderStatus::SrcEscrowCreated => "src_escrow_created",
            OrderStatus::DstEscrowCreated => "dst_escrow_created",
            OrderStatus::SecretRequested => "secret_requested",
            OrderStatus::SrcWithdrawn => "src_withdrawn",
            OrderStatus::DstWithdrawn => "dst_withdrawn",
            OrderStatus::Completed => "completed",
            OrderStatus::Expired => "expired",
            OrderStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Per-segment auction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Active,
    PriceFloorReached,
    Completed,
    Expired,
}

impl SegmentStatus {
    /// A segment stays claimable at the floor until a claim arrives or
    /// the auction deadline fires.
    pub fn is_claimable(&self) -> bool {
        matches!(self, SegmentStatus::Active | SegmentStatus::PriceFloorReached)
    }
}

/// A child of a segmented order. The leaf secret never appears here;
/// it is held by the coordinator vault until release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Segment id in 1..=SEGMENT_COUNT.
    pub id: u8,
    #[serde(with = "crate::amount")]
    pub amount: u128,
    pub start_price: Decimal,
    pub end_price: Decimal,
    pub current_price: Decimal,
    pub winner: Option<ResolverId>,
    pub status: SegmentStatus,
    pub leaf_hash: HexBytes32,
    pub merkle_proof: Vec<HexBytes32>,
}

/// Which side of the escrow pair a record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowSide {
    Src,
    Dst,
}

impl std::fmt::Display for EscrowSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscrowSide::Src => write!(f, "src"),
            EscrowSide::Dst => write!(f, "dst"),
        }
    }
}

/// On-chain escrow artifact tracked per (order, segment?, side).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowRecord {
    pub segment_id: Option<u8>,
    pub side: EscrowSide,
    pub address: String,
    pub creation_tx_hash: String,
    pub created_at: DateTime<Utc>,
    pub observed_funded_at: Option<DateTime<Utc>>,
    pub withdrawal_tx_hash: Option<String>,
}

/// Resolver lifecycle breadcrumb, persisted and rebroadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub step: String,
    pub details: serde_json::Value,
    pub segment_id: Option<u8>,
    pub resolver_id: Option<ResolverId>,
    pub ts: DateTime<Utc>,
}

/// Auction phase recorded in the persisted snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionPhase {
    Active,
    WinnerDeclared,
    FloorReached,
    Closed,
    Expired,
}

/// Persisted auction state, refreshed at most once per tick so a
/// restarted coordinator resumes from the last-known price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub kind: OrderKind,
    pub phase: AuctionPhase,
    pub start_price: Decimal,
    pub end_price: Decimal,
    /// Current price of a single auction; segmented orders carry
    /// per-segment prices on their [`Segment`] records instead.
    pub current_price: Option<Decimal>,
    pub tick_count: u32,
    pub last_tick_at: DateTime<Utc>,
}

/// A swap order as persisted by the coordinator. Wire form follows
/// the camelCase record schema clients consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
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
    pub hash_lock: HexBytes32,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub segment_leaf_hashes: Option<Vec<HexBytes32>>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    pub auction_snapshot: Option<AuctionSnapshot>,
    #[serde(default)]
    pub escrow_records: Vec<EscrowRecord>,
    #[serde(default)]
    pub progress_log: Vec<ProgressEntry>,
    pub winner: Option<ResolverId>,
    pub winning_price: Option<Decimal>,
}

impl Order {
    /// Look up a segment by its 1-based id.
    pub fn segment(&self, segment_id: u8) -> Result<&Segment, OrderError> {
        self.segments
            .iter()
            .find(|s| s.id == segment_id)
            .ok_or(OrderError::UnknownSegment {
                order_id: self.order_id.clone(),
                segment_id,
            })
    }

    /// Mutable segment lookup by 1-based id.
    pub fn segment_mut(&mut self, segment_id: u8) -> Result<&mut Segment, OrderError> {
        let order_id = self.order_id.clone();
        self.segments
            .iter_mut()
            .find(|s| s.id == segment_id)
            .ok_or(OrderError::UnknownSegment { order_id, segment_id })
    }

    /// Escrow amount for a scope: the segment amount for segmented
    /// fills, the full source amount otherwise.
    pub fn scope_amount(&self, segment_id: Option<u8>) -> Result<u128, OrderError> {
        match segment_id {
            Some(id) => Ok(self.segment(id)?.amount),
            None => Ok(self.src_amount),
        }
    }
}

/// Split an amount into `SEGMENT_COUNT` parts: integer division with
/// the remainder assigned to the last segment.
pub fn segment_amounts(total: u128) -> Vec<u128> {
    let count = SEGMENT_COUNT as u128;
    let base = total / count;
    let mut amounts = vec![base; SEGMENT_COUNT as usize];
    if let Some(last) = amounts.last_mut() {
        *last = base + total % count;
    }
    amounts
}

/// Starting price of a single auction: 1.2x market, rounded to the
/// nearest price unit.
pub fn single_start_price(market_price: Decimal) -> Decimal {
    round_price(market_price * Decimal::new(12, 1))
}

/// Tiered starting prices for the four segment sub-auctions, rounded
/// to the nearest price unit.
pub fn segment_start_prices(market_price: Decimal) -> Vec<Decimal> {
    [
        Decimal::new(1077, 3),
        Decimal::new(1051, 3),
        Decimal::new(1026, 3),
        Decimal::new(1000, 3),
    ]
    .iter()
    .map(|tier| round_price(market_price * tier))
    .collect()
}

/// Auction floor: market price reduced by the slippage fraction, kept
/// at full precision.
pub fn end_price(market_price: Decimal, slippage: Decimal) -> Decimal {
    market_price * (Decimal::ONE - slippage)
}

/// One multiplicative tick: reduce by `factor`, floor to the price
/// unit, and clamp at the auction floor.
pub fn decay_price(current: Decimal, factor: Decimal, floor: Decimal) -> Decimal {
    let reduced = (current * factor).floor();
    if reduced < floor {
        floor
    } else {
        reduced
    }
}

fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}
