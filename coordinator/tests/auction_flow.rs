//! Auction engine scenarios: single and segmented Dutch auctions,
//! claim races, price monotonicity, and deadline expiry.

use std::sync::Arc;

use chrono::Utc;
use crosslock_coordinator::auction::{AuctionEngine, AuctionHandle};
use crosslock_coordinator::bus::EventBus;
use crosslock_coordinator::config::{AuctionConfig, BusConfig};
use crosslock_coordinator::error::CoordinatorError;
use crosslock_coordinator::store::OrderStore;
use hashlock::HexBytes32;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use swap_protocols::{
    end_price, segment_amounts, segment_start_prices, single_start_price, Order, OrderKind,
    OrderStatus, Segment, SegmentStatus,
};
use tokio::sync::broadcast;

fn auction_config(soft_deadline_secs: u64) -> AuctionConfig {
    AuctionConfig {
        // Effectively disable the background scheduler; tests drive
        // ticks explicitly for deterministic trajectories.
        tick_interval_secs: 3_600,
        tick_factor: dec!(0.95),
        soft_deadline_secs,
    }
}

fn single_order(order_id: &str, market: Decimal, slippage: Decimal) -> Order {
    Order {
        order_id: order_id.to_string(),
        kind: OrderKind::Single,
        src_chain: "evm-sepolia".into(),
        dst_chain: "stellar-testnet".into(),
        src_token: "ETH".into(),
        dst_token: "XLM".into(),
        src_amount: 1,
        dst_amount: 39_000,
        market_price: market,
        slippage,
        buyer_src_address: "0xbuyer".into(),
        buyer_dst_address: "GBUYER".into(),
        hash_lock: HexBytes32([7u8; 32]),
        status: OrderStatus::Pending,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        segment_leaf_hashes: None,
        segments: Vec::new(),
        auction_snapshot: None,
        escrow_records: Vec::new(),
        progress_log: Vec::new(),
        winner: None,
        winning_price: None,
    }
}

fn segmented_order(order_id: &str, market: Decimal, slippage: Decimal) -> Order {
    let mut order = single_order(order_id, market, slippage);
    order.kind = OrderKind::Segmented;
    let amounts = segment_amounts(order.src_amount);
    let starts = segment_start_prices(market);
    let end = end_price(market, slippage);
    order.segments = amounts
        .iter()
        .zip(starts.iter())
        .enumerate()
        .map(|(index, (amount, start))| Segment {
            id: index as u8 + 1,
            amount: *amount,
            start_price: *start,
            end_price: end,
            current_price: *start,
            winner: None,
            status: SegmentStatus::Active,
            leaf_hash: HexBytes32([index as u8 + 1; 32]),
            merkle_proof: Vec::new(),
        })
        .collect();
    order
}

async fn engine_with(
    store: &Arc<OrderStore>,
    soft_deadline_secs: u64,
) -> (AuctionHandle, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new(
        BusConfig {
            queue_depth: 64,
            max_subscribers: 16,
        },
        0,
    ));
    let (shutdown, _) = broadcast::channel(1);
    let handle = AuctionEngine::spawn(
        auction_config(soft_deadline_secs),
        Arc::clone(store),
        Arc::clone(&bus),
        shutdown,
    )
    .await;
    (handle, bus)
}

#[tokio::test]
async fn test_single_happy_path_price_trajectory() {
    let store = Arc::new(OrderStore::in_memory());
    let (engine, _bus) = engine_with(&store, 900).await;

    store
        .put(single_order("ord-1", dec!(3900), dec!(0.02)))
        .await
        .unwrap();
    engine.admit("ord-1").await.unwrap();

    let order = store.get("ord-1").await.unwrap();
    assert_eq!(order.status, OrderStatus::AuctionActive);
    let snapshot = order.auction_snapshot.as_ref().unwrap();
    assert_eq!(snapshot.start_price, dec!(4680));
    assert_eq!(snapshot.end_price, dec!(3822.00));
    assert_eq!(snapshot.current_price, Some(dec!(4680)));

    for _ in 0..3 {
        engine.tick().await.unwrap();
    }
    let order = store.get("ord-1").await.unwrap();
    assert_eq!(
        order.auction_snapshot.as_ref().unwrap().current_price,
        Some(dec!(4011))
    );

    let accepted = engine.claim("ord-1", None, "res-a").await.unwrap();
    assert_eq!(accepted.winning_price, dec!(4011));

    let order = store.get("ord-1").await.unwrap();
    assert_eq!(order.status, OrderStatus::WinnerDeclared);
    assert_eq!(order.winner.as_deref(), Some("res-a"));
    assert_eq!(order.winning_price, Some(dec!(4011)));
}

#[tokio::test]
async fn test_single_price_monotone_and_floored() {
    let store = Arc::new(OrderStore::in_memory());
    let (engine, _bus) = engine_with(&store, 900).await;

    store
        .put(single_order("ord-1", dec!(3900), dec!(0.02)))
        .await
        .unwrap();
    engine.admit("ord-1").await.unwrap();

    let floor = end_price(dec!(3900), dec!(0.02));
    let mut previous = single_start_price(dec!(3900));
    for _ in 0..20 {
        engine.tick().await.unwrap();
        let order = store.get("ord-1").await.unwrap();
        let current = order
            .auction_snapshot
            .as_ref()
            .unwrap()
            .current_price
            .unwrap();
        assert!(current <= previous, "price must not increase");
        assert!(current >= floor, "price must not pass the floor");
        previous = current;
    }
    // Far past the decay horizon the price sits exactly at the floor,
    // and a late claim still wins there.
    assert_eq!(previous, floor);
    let accepted = engine.claim("ord-1", None, "res-late").await.unwrap();
    assert_eq!(accepted.winning_price, floor);
}

#[tokio::test]
async fn test_first_claim_wins_and_second_rejected() {
    let store = Arc::new(OrderStore::in_memory());
    let (engine, _bus) = engine_with(&store, 900).await;

    store
        .put(single_order("ord-1", dec!(3900), dec!(0.02)))
        .await
        .unwrap();
    engine.admit("ord-1").await.unwrap();

    let first = engine.claim("ord-1", None, "res-a").await;
    assert!(first.is_ok());
    let second = engine.claim("ord-1", None, "res-b").await;
    assert!(matches!(
        second,
        Err(CoordinatorError::AlreadyClaimed { .. })
    ));

    let order = store.get("ord-1").await.unwrap();
    assert_eq!(order.winner.as_deref(), Some("res-a"));
}

#[tokio::test]
async fn test_concurrent_claims_exactly_one_succeeds() {
    let store = Arc::new(OrderStore::in_memory());
    let (engine, _bus) = engine_with(&store, 900).await;

    store
        .put(single_order("ord-1", dec!(3900), dec!(0.02)))
        .await
        .unwrap();
    engine.admit("ord-1").await.unwrap();

    let mut tasks = Vec::new();
    for resolver in ["res-a", "res-b", "res-c", "res-d"] {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.claim("ord-1", None, resolver).await
        }));
    }
    let mut accepted = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(CoordinatorError::AlreadyClaimed { .. }) => rejected += 1,
            Err(other) => panic!("unexpected claim error: {}", other),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(rejected, 3);
}

#[tokio::test]
async fn test_segmented_happy_path() {
    let store = Arc::new(OrderStore::in_memory());
    let (engine, _bus) = engine_with(&store, 900).await;

    store
        .put(segmented_order("ord-1", dec!(3900), dec!(0.02)))
        .await
        .unwrap();
    engine.admit("ord-1").await.unwrap();

    let order = store.get("ord-1").await.unwrap();
    let starts: Vec<Decimal> = order.segments.iter().map(|s| s.start_price).collect();
    assert_eq!(starts, vec![dec!(4200), dec!(4099), dec!(4001), dec!(3900)]);

    // Segments 1 and 3 claimed immediately at tick 0 by distinct
    // resolvers, at their tiered starting prices.
    let claim1 = engine.claim("ord-1", Some(1), "res-a").await.unwrap();
    assert_eq!(claim1.winning_price, dec!(4200));
    let claim3 = engine.claim("ord-1", Some(3), "res-b").await.unwrap();
    assert_eq!(claim3.winning_price, dec!(4001));

    let order = store.get("ord-1").await.unwrap();
    assert_eq!(order.status, OrderStatus::WinnerDeclared);

    // Segments 2 and 4 decay to the common floor without a claim.
    for _ in 0..5 {
        engine.tick().await.unwrap();
    }
    let order = store.get("ord-1").await.unwrap();
    let seg = |id: u8| order.segments.iter().find(|s| s.id == id).unwrap();
    assert_eq!(seg(1).winner.as_deref(), Some("res-a"));
    assert_eq!(seg(3).winner.as_deref(), Some("res-b"));
    assert_eq!(seg(1).status, SegmentStatus::Completed);
    assert_eq!(seg(3).status, SegmentStatus::Completed);
    assert_eq!(seg(2).status, SegmentStatus::PriceFloorReached);
    assert_eq!(seg(4).status, SegmentStatus::PriceFloorReached);
    assert_eq!(seg(2).current_price, dec!(3822.00));
    assert_eq!(seg(4).current_price, dec!(3822.00));

    // A floor-reached segment is still claimable at the end price.
    let late = engine.claim("ord-1", Some(2), "res-c").await.unwrap();
    assert_eq!(late.winning_price, dec!(3822.00));

    // Re-claiming a settled segment is rejected.
    assert!(matches!(
        engine.claim("ord-1", Some(1), "res-d").await,
        Err(CoordinatorError::AlreadyClaimed { .. })
    ));
}

#[tokio::test]
async fn test_unclaimed_auction_expires_at_deadline() {
    let store = Arc::new(OrderStore::in_memory());
    // Zero inactivity budget: the first tick sweep expires it.
    let (engine, _bus) = engine_with(&store, 0).await;

    store
        .put(single_order("ord-1", dec!(3900), dec!(0.02)))
        .await
        .unwrap();
    engine.admit("ord-1").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    engine.tick().await.unwrap();

    let order = store.get("ord-1").await.unwrap();
    assert_eq!(order.status, OrderStatus::Expired);

    // Terminal orders reject further engine activity.
    assert!(matches!(
        engine.claim("ord-1", None, "res-a").await,
        Err(CoordinatorError::AuctionNotActive { .. })
    ));
    // And further store transitions.
    assert!(store
        .transition("ord-1", OrderStatus::SecretRequested)
        .await
        .is_err());
}

#[tokio::test]
async fn test_partially_claimed_order_survives_deadline() {
    let store = Arc::new(OrderStore::in_memory());
    let (engine, _bus) = engine_with(&store, 0).await;

    store
        .put(segmented_order("ord-1", dec!(3900), dec!(0.02)))
        .await
        .unwrap();
    engine.admit("ord-1").await.unwrap();
    engine.claim("ord-1", Some(2), "res-a").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    engine.tick().await.unwrap();

    let order = store.get("ord-1").await.unwrap();
    // The claimed segment keeps its winner; the rest expire, and the
    // order itself stays on the winner path.
    assert_eq!(order.status, OrderStatus::WinnerDeclared);
    let seg = |id: u8| order.segments.iter().find(|s| s.id == id).unwrap();
    assert_eq!(seg(2).status, SegmentStatus::Completed);
    assert_eq!(seg(1).status, SegmentStatus::Expired);
    assert_eq!(seg(3).status, SegmentStatus::Expired);
    assert_eq!(seg(4).status, SegmentStatus::Expired);
}

#[tokio::test]
async fn test_engine_recovers_from_persisted_snapshot() {
    let store = Arc::new(OrderStore::in_memory());
    let (engine, _bus) = engine_with(&store, 900).await;

    store
        .put(single_order("ord-1", dec!(3900), dec!(0.02)))
        .await
        .unwrap();
    engine.admit("ord-1").await.unwrap();
    for _ in 0..2 {
        engine.tick().await.unwrap();
    }

    // A fresh engine over the same store resumes from the last
    // persisted price instead of restarting at the top.
    let (recovered, _bus2) = engine_with(&store, 900).await;
    recovered.tick().await.unwrap();
    let order = store.get("ord-1").await.unwrap();
    assert_eq!(
        order.auction_snapshot.as_ref().unwrap().current_price,
        Some(dec!(4011))
    );

    let accepted = recovered.claim("ord-1", None, "res-a").await.unwrap();
    assert_eq!(accepted.winning_price, dec!(4011));
}
