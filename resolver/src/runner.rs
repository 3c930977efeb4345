//! Auction watcher: subscribes to the coordinator's event bus, claims
//! auctions once the price decays into the configured margin, and
//! hands wins to the swap orchestrator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use swap_protocols::{ActiveAuctionSummary, BusMessage, ClientFrame, ServerFrame};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::swap::SwapOrchestrator;

/// One claimable scope: an order, or one segment of it.
type Scope = (String, Option<u8>);

pub struct Runner {
    config: ResolverConfig,
    orchestrator: Arc<SwapOrchestrator>,
}

struct WatchState {
    /// End price per order, learned from auction_opened / snapshots.
    end_prices: HashMap<String, Decimal>,
    /// Scopes already claimed (or lost) — no repeat claims.
    settled: HashSet<Scope>,
}

impl Runner {
    pub fn new(config: ResolverConfig, orchestrator: Arc<SwapOrchestrator>) -> Self {
        Runner {
            config,
            orchestrator,
        }
    }

    /// Connect, subscribe, and resolve auctions until the connection
    /// drops.
    pub async fn run(&self) -> Result<()> {
        let (ws, _) = connect_async(&self.config.coordinator_ws).await?;
        let (mut write, mut read) = ws.split();
        info!("connected to coordinator bus at {}", self.config.coordinator_ws);

        let subscribe = serde_json::to_string(&ClientFrame::Subscribe {
            resolver_id: Some(self.config.resolver_id.clone()),
        })?;
        write.send(Message::Text(subscribe)).await?;
        // Catch up on auctions opened before we connected.
        let snapshot = serde_json::to_string(&ClientFrame::SnapshotRequest {})?;
        write.send(Message::Text(snapshot)).await?;

        let mut state = WatchState {
            end_prices: HashMap::new(),
            settled: HashSet::new(),
        };

        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(anyhow!("bus connection error: {}", e)),
            };

            if let Ok(message) = serde_json::from_str::<BusMessage>(&text) {
                for (scope, price) in self.evaluate(&mut state, &message) {
                    if state.settled.contains(&scope) {
                        continue;
                    }
                    info!(
                        order_id = %scope.0,
                        segment_id = ?scope.1,
                        %price,
                        "price inside margin, claiming"
                    );
                    let claim = serde_json::to_string(&ClientFrame::Claim {
                        order_id: scope.0.clone(),
                        segment_id: scope.1,
                        resolver_id: self.config.resolver_id.clone(),
                    })?;
                    write.send(Message::Text(claim)).await?;
                    state.settled.insert(scope);
                }
                continue;
            }

            match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Snapshot { auctions }) => {
                    for auction in &auctions {
                        self.record_snapshot(&mut state, auction);
                    }
                }
                Ok(ServerFrame::ClaimResult {
                    order_id,
                    segment_id,
                    accepted,
                    code,
                    winning_price,
                }) => {
                    if accepted {
                        info!(
                            order_id = %order_id,
                            ?segment_id,
                            ?winning_price,
                            "claim accepted, executing swap"
                        );
                        let orchestrator = Arc::clone(&self.orchestrator);
                        tokio::spawn(async move {
                            if let Err(e) = orchestrator.execute(&order_id, segment_id).await {
                                warn!(order_id = %order_id, "swap execution failed: {}", e);
                            }
                        });
                    } else {
                        debug!(
                            order_id = %order_id,
                            ?segment_id,
                            ?code,
                            "claim rejected"
                        );
                    }
                }
                Ok(ServerFrame::Subscribed { subscriber_id }) => {
                    debug!("subscribed to bus as {}", subscriber_id);
                }
                Ok(ServerFrame::Error { code, message }) => {
                    warn!("bus error frame: {}: {}", code, message);
                }
                Err(e) => debug!("ignoring unrecognized frame: {}", e),
            }
        }

        Ok(())
    }

    fn record_snapshot(&self, state: &mut WatchState, auction: &ActiveAuctionSummary) {
        state
            .end_prices
            .insert(auction.order_id.clone(), auction.end_price);
    }

    /// Scopes whose current price has decayed inside the claim margin.
    fn evaluate(&self, state: &mut WatchState, message: &BusMessage) -> Vec<(Scope, Decimal)> {
        let margin = Decimal::ONE + self.config.strategy.claim_margin;
        match message {
            BusMessage::AuctionOpened { order_id, payload, .. } => {
                state.end_prices.insert(order_id.clone(), payload.end_price);
                Vec::new()
            }
            BusMessage::PriceTick { order_id, payload, .. } => {
                match state.end_prices.get(order_id) {
                    Some(end) if payload.current_price <= *end * margin => {
                        vec![((order_id.clone(), None), payload.current_price)]
                    }
                    _ => Vec::new(),
                }
            }
            BusMessage::SegmentTick {
                order_id,
                segment_id,
                payload,
                ..
            } => match state.end_prices.get(order_id) {
                Some(end) if payload.current_price <= *end * margin => {
                    vec![((order_id.clone(), Some(*segment_id)), payload.current_price)]
                }
                _ => Vec::new(),
            },
            BusMessage::WinnerDeclared { order_id, .. } => {
                state.settled.insert((order_id.clone(), None));
                Vec::new()
            }
            BusMessage::SegmentWinnerDeclared {
                order_id,
                segment_id,
                ..
            } => {
                state.settled.insert((order_id.clone(), Some(*segment_id)));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}
