//! Crosslock coordinator: the off-chain relayer node for cross-chain
//! HTLC swaps.
//!
//! The node wires together the order store, secret vault, Dutch
//! auction engine, event bus, escrow verifier, and relayer API behind
//! an explicit lifecycle handle: construct with [`CoordinatorNode::new`],
//! bring the surfaces up with [`CoordinatorNode::start`], and tear
//! down with [`CoordinatorNode::shutdown`]. The coordinator never
//! custodies funds; it matches orders, verifies escrows, and releases
//! secrets at most once per scope.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::info;

pub mod api;
pub mod auction;
pub mod bus;
pub mod config;
pub mod error;
pub mod store;
pub mod vault;
pub mod verifier;

pub use config::CoordinatorConfig;
pub use error::CoordinatorError;

use api::{ApiContext, ApiServer};
use auction::{AuctionEngine, AuctionHandle};
use bus::EventBus;
use store::OrderStore;
use vault::SecretVault;
use verifier::EscrowVerifier;

/// The coordinator node. Owns every component handle; dropping the
/// node after [`CoordinatorNode::shutdown`] stops all background
/// tasks.
pub struct CoordinatorNode {
    config: CoordinatorConfig,
    store: Arc<OrderStore>,
    vault: Arc<SecretVault>,
    verifier: Arc<EscrowVerifier>,
    bus: Arc<EventBus>,
    engine: AuctionHandle,
    shutdown: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
}

impl CoordinatorNode {
    /// Build the node: open the store (recovering persisted orders),
    /// spawn the auction engine, and prepare the bus and verifier.
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        info!("initializing coordinator node: {}", config.node_id);

        let store = Arc::new(OrderStore::open(&config.storage)?);
        let vault = Arc::new(SecretVault::new());
        let verifier = Arc::new(EscrowVerifier::new(config.verifier.clone()));
        let bus = Arc::new(EventBus::new(config.bus.clone(), config.ws_port));
        let (shutdown, _) = broadcast::channel(1);

        let engine = AuctionEngine::spawn(
            config.auction.clone(),
            Arc::clone(&store),
            Arc::clone(&bus),
            shutdown.clone(),
        )
        .await;

        Ok(CoordinatorNode {
            config,
            store,
            vault,
            verifier,
            bus,
            engine,
            shutdown,
            started_at: Utc::now(),
        })
    }

    /// Bring up the event bus and relayer API.
    pub async fn start(&self) -> Result<()> {
        self.bus
            .start(self.engine.clone(), self.shutdown.clone())
            .await?;

        let context = Arc::new(ApiContext {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            vault: Arc::clone(&self.vault),
            verifier: Arc::clone(&self.verifier),
            engine: self.engine.clone(),
            bus: Arc::clone(&self.bus),
            started_at: self.started_at,
        });
        ApiServer::new(context).start(self.shutdown.clone()).await?;

        info!(
            "coordinator {} started: api port {}, ws port {}",
            self.config.node_id, self.config.api_port, self.config.ws_port
        );
        Ok(())
    }

    /// Signal every background task to stop and flush the store.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down coordinator node: {}", self.config.node_id);
        let _ = self.shutdown.send(());
        self.store.flush()?;
        Ok(())
    }

    pub fn engine(&self) -> AuctionHandle {
        self.engine.clone()
    }

    pub fn store(&self) -> Arc<OrderStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}
