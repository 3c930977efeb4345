//! Order store: the single source of truth for order records.
//!
//! A keyed in-memory map mediates every cross-handler mutation; status
//! changes go through compare-and-set under the write lock so the
//! lifecycle DAG cannot be violated by interleaved handlers. When
//! persistence is enabled every committed record is mirrored into a
//! sled tree and reloaded at startup, which is what lets a restarted
//! coordinator resume auctions from the last persisted price.

use std::collections::HashMap;

use swap_protocols::{Order, OrderError, OrderFilter, OrderStatus};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("order not found: {0}")]
    NotFound(String),
    #[error("order already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Transition(#[from] OrderError),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("codec error: {0}")]
    Codec(String),
}

/// Keyed order store with CAS status transitions and optional sled
/// mirroring.
pub struct OrderStore {
    orders: RwLock<HashMap<String, Order>>,
    tree: Option<sled::Db>,
}

impl OrderStore {
    /// Open the store, loading previously persisted orders when the
    /// config enables persistence.
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        if !config.persistent {
            return Ok(Self::in_memory());
        }

        let path = std::path::Path::new(&config.data_dir).join("orders");
        let db = sled::open(&path).map_err(|e| StoreError::Persistence(e.to_string()))?;

        let mut orders = HashMap::new();
        for entry in db.iter() {
            let (key, value) = entry.map_err(|e| StoreError::Persistence(e.to_string()))?;
            match serde_json::from_slice::<Order>(&value) {
                Ok(order) => {
                    orders.insert(order.order_id.clone(), order);
                }
                Err(e) => {
                    // A corrupt record is skipped, not fatal: the rest
                    // of the store is still usable.
                    warn!(
                        "skipping corrupt order record {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                }
            }
        }

        if !orders.is_empty() {
            info!("recovered {} persisted orders", orders.len());
        }

        Ok(OrderStore {
            orders: RwLock::new(orders),
            tree: Some(db),
        })
    }

    /// Purely in-memory store for tests and dry runs.
    pub fn in_memory() -> Self {
        OrderStore {
            orders: RwLock::new(HashMap::new()),
            tree: None,
        }
    }

    /// Insert a new order. Fails if the id is already taken.
    pub async fn put(&self, order: Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.order_id) {
            return Err(StoreError::AlreadyExists(order.order_id));
        }
        self.persist(&order)?;
        debug!(order_id = %order.order_id, "order stored");
        orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    pub async fn get(&self, order_id: &str) -> Result<Order, StoreError> {
        let orders = self.orders.read().await;
        orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(order_id.to_string()))
    }

    /// Apply a partial update under the write lock. The closure sees
    /// the current record; on success the mutated record is stamped
    /// and persisted. Errors leave the stored record untouched.
    pub async fn update<F>(&self, order_id: &str, mutate: F) -> Result<Order, StoreError>
    where
        F: FnOnce(&mut Order) -> Result<(), StoreError>,
    {
        let mut orders = self.orders.write().await;
        let current = orders
            .get(order_id)
            .ok_or_else(|| StoreError::NotFound(order_id.to_string()))?;

        let mut candidate = current.clone();
        mutate(&mut candidate)?;
        candidate.updated_at = chrono::Utc::now();
        self.persist(&candidate)?;
        orders.insert(order_id.to_string(), candidate.clone());
        Ok(candidate)
    }

    /// Compare-and-set status transition, enforced against the
    /// lifecycle DAG. Terminal records only accept reads.
    pub async fn transition(
        &self,
        order_id: &str,
        next: OrderStatus,
    ) -> Result<Order, StoreError> {
        self.update(order_id, |order| {
            order.status.ensure_transition(next)?;
            order.status = next;
            Ok(())
        })
        .await
    }

    /// Scan orders matching the filter. Unfiltered fields match all.
    pub async fn scan(&self, filter: &OrderFilter) -> Vec<Order> {
        let orders = self.orders.read().await;
        let mut matched: Vec<Order> = orders
            .values()
            .filter(|order| {
                filter.status.map_or(true, |s| order.status == s)
                    && filter
                        .src_chain
                        .as_ref()
                        .map_or(true, |c| &order.src_chain == c)
                    && filter
                        .dst_chain
                        .as_ref()
                        .map_or(true, |c| &order.dst_chain == c)
                    && filter.buyer_address.as_ref().map_or(true, |b| {
                        &order.buyer_src_address == b || &order.buyer_dst_address == b
                    })
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matched
    }

    /// Orders currently in an auction-bearing status, used by the
    /// engine to rebuild live state after a restart.
    pub async fn active_auctions(&self) -> Vec<Order> {
        self.scan(&OrderFilter {
            status: Some(OrderStatus::AuctionActive),
            ..OrderFilter::default()
        })
        .await
    }

    /// Flush the sled tree; called on shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        if let Some(db) = &self.tree {
            db.flush().map_err(|e| StoreError::Persistence(e.to_string()))?;
        }
        Ok(())
    }

    fn persist(&self, order: &Order) -> Result<(), StoreError> {
        if let Some(db) = &self.tree {
            let bytes = serde_json::to_vec(order).map_err(|e| StoreError::Codec(e.to_string()))?;
            db.insert(order.order_id.as_bytes(), bytes)
                .map_err(|e| StoreError::Persistence(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hashlock::HexBytes32;
    use rust_decimal_macros::dec;
    use swap_protocols::OrderKind;

    fn sample_order(id: &str) -> Order {
        Order {
            order_id: id.to_string(),
            kind: OrderKind::Single,
            src_chain: "evm-sepolia".into(),
            dst_chain: "stellar-testnet".into(),
            src_token: "ETH".into(),
            dst_token: "XLM".into(),
            src_amount: 1,
            dst_amount: 39_000,
            market_price: dec!(3900),
            slippage: dec!(0.02),
            buyer_src_address: "0xbuyer".into(),
            buyer_dst_address: "GBUYER".into(),
            hash_lock: HexBytes32([0u8; 32]),
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

    #[tokio::test]
    async fn test_put_and_get() {
        let store = OrderStore::in_memory();
        store.put(sample_order("ord-1")).await.unwrap();
        let fetched = store.get("ord-1").await.unwrap();
        assert_eq!(fetched.status, OrderStatus::Pending);
        assert!(matches!(
            store.put(sample_order("ord-1")).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_follows_dag() {
        let store = OrderStore::in_memory();
        store.put(sample_order("ord-1")).await.unwrap();

        store
            .transition("ord-1", OrderStatus::AuctionActive)
            .await
            .unwrap();
        let err = store
            .transition("ord-1", OrderStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
        // Failed CAS leaves the record unchanged.
        assert_eq!(
            store.get("ord-1").await.unwrap().status,
            OrderStatus::AuctionActive
        );
    }

    #[tokio::test]
    async fn test_terminal_orders_reject_writes() {
        let store = OrderStore::in_memory();
        store.put(sample_order("ord-1")).await.unwrap();
        store
            .transition("ord-1", OrderStatus::Expired)
            .await
            .unwrap();
        for next in [
            OrderStatus::AuctionActive,
            OrderStatus::SecretRequested,
            OrderStatus::Completed,
        ] {
            assert!(store.transition("ord-1", next).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_scan_filters() {
        let store = OrderStore::in_memory();
        store.put(sample_order("ord-1")).await.unwrap();
        let mut other = sample_order("ord-2");
        other.src_chain = "evm-mainnet".into();
        store.put(other).await.unwrap();

        let all = store.scan(&OrderFilter::default()).await;
        assert_eq!(all.len(), 2);

        let filtered = store
            .scan(&OrderFilter {
                src_chain: Some("evm-mainnet".into()),
                ..OrderFilter::default()
            })
            .await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].order_id, "ord-2");
    }

    #[tokio::test]
    async fn test_sled_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            persistent: true,
        };

        {
            let store = OrderStore::open(&config).unwrap();
            store.put(sample_order("ord-1")).await.unwrap();
            store
                .transition("ord-1", OrderStatus::AuctionActive)
                .await
                .unwrap();
            store.flush().unwrap();
        }

        let reopened = OrderStore::open(&config).unwrap();
        let recovered = reopened.get("ord-1").await.unwrap();
        assert_eq!(recovered.status, OrderStatus::AuctionActive);
    }
}
