//! Dutch-auction engine.
//!
//! All auction state is owned by one engine task; admissions, claims,
//! ticks, and snapshot queries arrive as commands over an mpsc channel,
//! which serializes every mutation per order and makes claim ordering
//! FIFO by arrival. The tick scheduler re-reads nothing from closures:
//! each tick decays the live prices and writes them through the order
//! store, so a restarted coordinator resumes from the last persisted
//! price rather than replaying from the start.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use swap_protocols::{
    decay_price, ActiveAuctionSummary, AuctionClosedPayload, AuctionOpenedPayload, AuctionPhase,
    AuctionSnapshot, BusMessage, OrderError, OrderKind, OrderStatus, PriceTickPayload,
    SegmentStatus, SegmentSummary, WinnerPayload,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::AuctionConfig;
use crate::error::CoordinatorError;
use crate::store::{OrderStore, StoreError};

/// Outcome of an accepted claim.
#[derive(Debug, Clone)]
pub struct ClaimAccepted {
    pub winning_price: Decimal,
}

enum EngineCommand {
    Admit {
        order_id: String,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Claim {
        order_id: String,
        segment_id: Option<u8>,
        resolver_id: String,
        reply: oneshot::Sender<Result<ClaimAccepted, CoordinatorError>>,
    },
    Tick {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ActiveAuctionSummary>>,
    },
}

/// Cloneable handle for talking to the engine task.
#[derive(Clone)]
pub struct AuctionHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl AuctionHandle {
    /// Attach an auction to a pending order and open it.
    pub async fn admit(&self, order_id: &str) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Admit {
                order_id: order_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| CoordinatorError::ShuttingDown)?;
        rx.await.map_err(|_| CoordinatorError::ShuttingDown)?
    }

    /// Claim an order or one segment of it at the current price.
    pub async fn claim(
        &self,
        order_id: &str,
        segment_id: Option<u8>,
        resolver_id: &str,
    ) -> Result<ClaimAccepted, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Claim {
                order_id: order_id.to_string(),
                segment_id,
                resolver_id: resolver_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| CoordinatorError::ShuttingDown)?;
        rx.await.map_err(|_| CoordinatorError::ShuttingDown)?
    }

    /// Run one tick pass. The scheduler calls this on its interval;
    /// tests call it directly for deterministic price trajectories.
    pub async fn tick(&self) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Tick { reply })
            .await
            .map_err(|_| CoordinatorError::ShuttingDown)?;
        rx.await.map_err(|_| CoordinatorError::ShuttingDown)
    }

    /// Summaries of the active auction set, for re-subscribers.
    pub async fn snapshot(&self) -> Result<Vec<ActiveAuctionSummary>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Snapshot { reply })
            .await
            .map_err(|_| CoordinatorError::ShuttingDown)?;
        rx.await.map_err(|_| CoordinatorError::ShuttingDown)
    }
}

struct SingleState {
    current: Decimal,
    winner: Option<String>,
}

struct SegmentState {
    id: u8,
    current: Decimal,
    status: SegmentStatus,
    winner: Option<String>,
    leaf_hash: hashlock::Bytes32,
}

struct LiveAuction {
    kind: OrderKind,
    start_price: Decimal,
    end_price: Decimal,
    single: Option<SingleState>,
    segments: Vec<SegmentState>,
    tick_count: u32,
    last_tick_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl LiveAuction {
    fn phase(&self) -> AuctionPhase {
        if let Some(single) = &self.single {
            if single.winner.is_some() {
                AuctionPhase::WinnerDeclared
            } else if single.current <= self.end_price {
                AuctionPhase::FloorReached
            } else {
                AuctionPhase::Active
            }
        } else if self.segments.iter().any(|s| s.winner.is_some()) {
            AuctionPhase::WinnerDeclared
        } else if self
            .segments
            .iter()
            .all(|s| s.status == SegmentStatus::PriceFloorReached)
        {
            AuctionPhase::FloorReached
        } else {
            AuctionPhase::Active
        }
    }

    fn snapshot(&self, phase: AuctionPhase) -> AuctionSnapshot {
        AuctionSnapshot {
            kind: self.kind,
            phase,
            start_price: self.start_price,
            end_price: self.end_price,
            current_price: self.single.as_ref().map(|s| s.current),
            tick_count: self.tick_count,
            last_tick_at: self.last_tick_at,
        }
    }
}

/// The engine: spawns the command loop and the tick scheduler.
pub struct AuctionEngine;

impl AuctionEngine {
    /// Spawn the engine task, rebuild live state from the store, and
    /// return the command handle.
    pub async fn spawn(
        config: AuctionConfig,
        store: Arc<OrderStore>,
        bus: Arc<EventBus>,
        shutdown: broadcast::Sender<()>,
    ) -> AuctionHandle {
        let (tx, rx) = mpsc::channel(256);
        let handle = AuctionHandle { tx };

        let mut worker = EngineWorker {
            config: config.clone(),
            store,
            bus,
            live: HashMap::new(),
        };
        worker.recover().await;

        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut rx = rx;
            loop {
                tokio::select! {
                    command = rx.recv() => {
                        match command {
                            Some(command) => worker.handle(command).await,
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("auction engine shutting down");
                        break;
                    }
                }
            }
        });

        // Tick scheduler: a plain interval that drives the engine
        // through its own command channel.
        let scheduler_handle = handle.clone();
        let mut scheduler_shutdown = shutdown.subscribe();
        let tick_interval = std::time::Duration::from_secs(config.tick_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick completes immediately; skip it so
            // prices hold at the start price for one full period.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if scheduler_handle.tick().await.is_err() {
                            break;
                        }
                    }
                    _ = scheduler_shutdown.recv() => break,
                }
            }
        });

        handle
    }
}

struct EngineWorker {
    config: AuctionConfig,
    store: Arc<OrderStore>,
    bus: Arc<EventBus>,
    live: HashMap<String, LiveAuction>,
}

impl EngineWorker {
    /// Rebuild live auctions from persisted snapshots after a restart.
    async fn recover(&mut self) {
        for order in self.store.active_auctions().await {
            let Some(snapshot) = order.auction_snapshot.clone() else {
                warn!(order_id = %order.order_id, "active order without snapshot, skipping");
                continue;
            };
            let live = LiveAuction {
                kind: order.kind,
                start_price: snapshot.start_price,
                end_price: snapshot.end_price,
                single: match order.kind {
                    OrderKind::Single => Some(SingleState {
                        current: snapshot.current_price.unwrap_or(snapshot.start_price),
                        winner: order.winner.clone(),
                    }),
                    OrderKind::Segmented => None,
                },
                segments: order
                    .segments
                    .iter()
                    .map(|s| SegmentState {
                        id: s.id,
                        current: s.current_price,
                        status: s.status,
                        winner: s.winner.clone(),
                        leaf_hash: s.leaf_hash.0,
                    })
                    .collect(),
                tick_count: snapshot.tick_count,
                last_tick_at: snapshot.last_tick_at,
                last_activity_at: Utc::now(),
            };
            info!(order_id = %order.order_id, "resuming auction from persisted state");
            self.live.insert(order.order_id.clone(), live);
        }
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Admit { order_id, reply } => {
                let _ = reply.send(self.admit(&order_id).await);
            }
            EngineCommand::Claim {
                order_id,
                segment_id,
                resolver_id,
                reply,
            } => {
                let _ = reply.send(self.claim(&order_id, segment_id, &resolver_id).await);
            }
            EngineCommand::Tick { reply } => {
                self.run_tick().await;
                let _ = reply.send(());
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.active_summaries());
            }
        }
    }

    async fn admit(&mut self, order_id: &str) -> Result<(), CoordinatorError> {
        let order = self.store.transition(order_id, OrderStatus::AuctionActive).await?;

        let (start_price, segment_starts) = match order.kind {
            OrderKind::Single => (
                order
                    .auction_snapshot
                    .as_ref()
                    .map(|s| s.start_price)
                    .unwrap_or_else(|| swap_protocols::single_start_price(order.market_price)),
                None,
            ),
            OrderKind::Segmented => {
                let starts: Vec<Decimal> =
                    order.segments.iter().map(|s| s.start_price).collect();
                let top = starts.first().copied().unwrap_or(order.market_price);
                (top, Some(starts))
            }
        };
        let end_price = swap_protocols::end_price(order.market_price, order.slippage);

        let live = LiveAuction {
            kind: order.kind,
            start_price,
            end_price,
            single: match order.kind {
                OrderKind::Single => Some(SingleState {
                    current: start_price,
                    winner: None,
                }),
                OrderKind::Segmented => None,
            },
            segments: order
                .segments
                .iter()
                .map(|s| SegmentState {
                    id: s.id,
                    current: s.current_price,
                    status: s.status,
                    winner: s.winner.clone(),
                    leaf_hash: s.leaf_hash.0,
                })
                .collect(),
            tick_count: 0,
            last_tick_at: Utc::now(),
            last_activity_at: Utc::now(),
        };

        let snapshot = live.snapshot(AuctionPhase::Active);
        self.store
            .update(order_id, |order| {
                order.auction_snapshot = Some(snapshot.clone());
                Ok(())
            })
            .await?;

        self.bus.publish(&BusMessage::AuctionOpened {
            order_id: order_id.to_string(),
            ts: Utc::now(),
            payload: AuctionOpenedPayload {
                kind: order.kind,
                start_price,
                end_price,
                segment_start_prices: segment_starts,
            },
        });

        info!(order_id, kind = %order.kind, %start_price, %end_price, "auction opened");
        self.live.insert(order_id.to_string(), live);
        Ok(())
    }

    async fn claim(
        &mut self,
        order_id: &str,
        segment_id: Option<u8>,
        resolver_id: &str,
    ) -> Result<ClaimAccepted, CoordinatorError> {
        let Some(live) = self.live.get_mut(order_id) else {
            // No live auction: distinguish already-settled orders from
            // unknown ones for a useful rejection code.
            return match self.store.get(order_id).await {
                Ok(order) if order.winner.is_some() => Err(CoordinatorError::AlreadyClaimed {
                    order_id: order_id.to_string(),
                    segment_id,
                }),
                Ok(_) => Err(CoordinatorError::AuctionNotActive {
                    order_id: order_id.to_string(),
                }),
                Err(e) => Err(e.into()),
            };
        };

        match (live.kind, segment_id) {
            (OrderKind::Single, None) => {
                let single = live.single.as_mut().expect("single auction state");
                if single.winner.is_some() {
                    return Err(CoordinatorError::AlreadyClaimed {
                        order_id: order_id.to_string(),
                        segment_id: None,
                    });
                }
                let winning_price = single.current;
                single.winner = Some(resolver_id.to_string());
                live.last_activity_at = Utc::now();

                let snapshot = live.snapshot(AuctionPhase::WinnerDeclared);
                self.store
                    .update(order_id, |order| {
                        order.status.ensure_transition(OrderStatus::WinnerDeclared)?;
                        order.status = OrderStatus::WinnerDeclared;
                        order.winner = Some(resolver_id.to_string());
                        order.winning_price = Some(winning_price);
                        order.auction_snapshot = Some(snapshot.clone());
                        Ok(())
                    })
                    .await?;

                self.bus.publish(&BusMessage::WinnerDeclared {
                    order_id: order_id.to_string(),
                    ts: Utc::now(),
                    payload: WinnerPayload {
                        resolver_id: resolver_id.to_string(),
                        winning_price,
                    },
                });
                self.bus.publish(&BusMessage::AuctionClosed {
                    order_id: order_id.to_string(),
                    ts: Utc::now(),
                    payload: AuctionClosedPayload {
                        phase: AuctionPhase::WinnerDeclared,
                        reason: None,
                    },
                });

                info!(order_id, resolver_id, %winning_price, "winner declared");
                self.live.remove(order_id);
                Ok(ClaimAccepted { winning_price })
            }
            (OrderKind::Segmented, Some(segment_id)) => {
                let Some(segment) = live.segments.iter_mut().find(|s| s.id == segment_id) else {
                    return Err(OrderError::UnknownSegment {
                        order_id: order_id.to_string(),
                        segment_id,
                    }
                    .into());
                };
                if segment.winner.is_some() || !segment.status.is_claimable() {
                    return Err(CoordinatorError::AlreadyClaimed {
                        order_id: order_id.to_string(),
                        segment_id: Some(segment_id),
                    });
                }
                let winning_price = segment.current;
                segment.winner = Some(resolver_id.to_string());
                segment.status = SegmentStatus::Completed;
                live.last_activity_at = Utc::now();

                let first_claim = self
                    .store
                    .get(order_id)
                    .await
                    .map(|o| o.status == OrderStatus::AuctionActive)
                    .unwrap_or(false);
                let snapshot = live.snapshot(live.phase());
                self.store
                    .update(order_id, |order| {
                        if first_claim {
                            order.status.ensure_transition(OrderStatus::WinnerDeclared)?;
                            order.status = OrderStatus::WinnerDeclared;
                        }
                        let seg = order
                            .segment_mut(segment_id)
                            .map_err(StoreError::Transition)?;
                        seg.winner = Some(resolver_id.to_string());
                        seg.status = SegmentStatus::Completed;
                        seg.current_price = winning_price;
                        order.auction_snapshot = Some(snapshot.clone());
                        Ok(())
                    })
                    .await?;

                self.bus.publish(&BusMessage::SegmentWinnerDeclared {
                    order_id: order_id.to_string(),
                    segment_id,
                    ts: Utc::now(),
                    payload: WinnerPayload {
                        resolver_id: resolver_id.to_string(),
                        winning_price,
                    },
                });
                info!(order_id, segment_id, resolver_id, %winning_price, "segment winner declared");

                // All four claimed: the auction phase is over.
                if live.segments.iter().all(|s| s.winner.is_some()) {
                    self.bus.publish(&BusMessage::AuctionClosed {
                        order_id: order_id.to_string(),
                        ts: Utc::now(),
                        payload: AuctionClosedPayload {
                            phase: AuctionPhase::WinnerDeclared,
                            reason: None,
                        },
                    });
                    self.live.remove(order_id);
                }
                Ok(ClaimAccepted { winning_price })
            }
            (OrderKind::Single, Some(segment_id)) => Err(OrderError::UnknownSegment {
                order_id: order_id.to_string(),
                segment_id,
            }
            .into()),
            (OrderKind::Segmented, None) => Err(OrderError::MalformedRequest(
                "segmented orders are claimed per segment".to_string(),
            )
            .into()),
        }
    }

    async fn run_tick(&mut self) {
        let now = Utc::now();
        let deadline = chrono::Duration::seconds(self.config.soft_deadline_secs as i64);
        let order_ids: Vec<String> = self.live.keys().cloned().collect();

        for order_id in order_ids {
            let expired = {
                let live = self.live.get(&order_id).expect("live auction present");
                now - live.last_activity_at > deadline
            };
            if expired {
                self.expire(&order_id).await;
                continue;
            }
            if let Err(e) = self.tick_one(&order_id, now).await {
                error!(order_id = %order_id, "tick failed: {}", e);
            }
        }
    }

    async fn tick_one(&mut self, order_id: &str, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let factor = self.config.tick_factor;
        let Some(live) = self.live.get_mut(order_id) else {
            return Ok(());
        };

        let mut messages = Vec::new();
        let mut moved = false;
        live.tick_count += 1;
        live.last_tick_at = now;

        if let Some(single) = live.single.as_mut() {
            if single.winner.is_none() && single.current > live.end_price {
                single.current = decay_price(single.current, factor, live.end_price);
                moved = true;
                messages.push(BusMessage::PriceTick {
                    order_id: order_id.to_string(),
                    ts: now,
                    payload: PriceTickPayload {
                        current_price: single.current,
                        tick_count: live.tick_count,
                        floor_reached: single.current <= live.end_price,
                    },
                });
            }
        }

        for segment in live.segments.iter_mut() {
            if segment.status != SegmentStatus::Active {
                continue;
            }
            segment.current = decay_price(segment.current, factor, live.end_price);
            moved = true;
            let floored = segment.current <= live.end_price;
            if floored {
                // Still claimable at the floor; only the price stops
                // moving.
                segment.status = SegmentStatus::PriceFloorReached;
            }
            messages.push(BusMessage::SegmentTick {
                order_id: order_id.to_string(),
                segment_id: segment.id,
                ts: now,
                payload: PriceTickPayload {
                    current_price: segment.current,
                    tick_count: live.tick_count,
                    floor_reached: floored,
                },
            });
        }

        if moved {
            let snapshot = live.snapshot(live.phase());
            let segment_prices: Vec<(u8, Decimal, SegmentStatus)> = live
                .segments
                .iter()
                .map(|s| (s.id, s.current, s.status))
                .collect();
            self.store
                .update(order_id, |order| {
                    order.auction_snapshot = Some(snapshot.clone());
                    for (id, price, status) in &segment_prices {
                        if let Ok(seg) = order.segment_mut(*id) {
                            seg.current_price = *price;
                            if seg.winner.is_none() {
                                seg.status = *status;
                            }
                        }
                    }
                    Ok(())
                })
                .await?;
            for message in &messages {
                self.bus.publish(message);
            }
            debug!(order_id, tick = self.live[order_id].tick_count, "price tick");
        }
        Ok(())
    }

    async fn expire(&mut self, order_id: &str) {
        let Some(live) = self.live.remove(order_id) else {
            return;
        };
        let any_winner = live.single.as_ref().map(|s| s.winner.is_some()).unwrap_or(false)
            || live.segments.iter().any(|s| s.winner.is_some());

        let phase = if any_winner {
            AuctionPhase::Closed
        } else {
            AuctionPhase::Expired
        };
        let snapshot = live.snapshot(phase);

        let result = self
            .store
            .update(order_id, |order| {
                for segment in order.segments.iter_mut() {
                    if segment.winner.is_none() {
                        segment.status = SegmentStatus::Expired;
                    }
                }
                if !any_winner {
                    order.status.ensure_transition(OrderStatus::Expired)?;
                    order.status = OrderStatus::Expired;
                }
                order.auction_snapshot = Some(snapshot.clone());
                Ok(())
            })
            .await;
        if let Err(e) = result {
            error!(order_id, "failed to persist auction expiry: {}", e);
        }

        self.bus.publish(&BusMessage::AuctionClosed {
            order_id: order_id.to_string(),
            ts: Utc::now(),
            payload: AuctionClosedPayload {
                phase,
                reason: Some("auction deadline reached".to_string()),
            },
        });
        info!(order_id, any_winner, "auction expired by soft deadline");
    }

    fn active_summaries(&self) -> Vec<ActiveAuctionSummary> {
        let mut summaries: Vec<ActiveAuctionSummary> = self
            .live
            .iter()
            .map(|(order_id, live)| ActiveAuctionSummary {
                order_id: order_id.clone(),
                kind: live.kind,
                end_price: live.end_price,
                current_price: live.single.as_ref().map(|s| s.current),
                segments: live
                    .segments
                    .iter()
                    .map(|s| SegmentSummary {
                        segment_id: s.id,
                        current_price: s.current,
                        status: s.status,
                        leaf_hash: hashlock::HexBytes32(s.leaf_hash),
                    })
                    .collect(),
            })
            .collect();
        summaries.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        summaries
    }
}
