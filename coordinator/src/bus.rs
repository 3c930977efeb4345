//! Event bus: WebSocket hub between the coordinator and participants.
//!
//! Outbound messages fan out to every subscriber in publication order.
//! Each subscriber owns a bounded queue; a full queue drops that
//! subscriber, never the publisher. Inbound frames are typed; unknown
//! tags get an error frame back instead of being silently dropped.
//! Claims are forwarded to the auction engine in arrival order, which
//! is what makes claim tie-breaking FIFO.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use swap_protocols::{BusMessage, ClientFrame, ServerFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auction::AuctionHandle;
use crate::config::BusConfig;

struct Subscriber {
    tx: mpsc::Sender<Message>,
    resolver_id: Option<String>,
}

/// The hub. Shared as `Arc<EventBus>`; the subscriber table is only
/// mutated by connection tasks and the publisher's drop path.
pub struct EventBus {
    config: BusConfig,
    ws_port: u16,
    subscribers: DashMap<String, Subscriber>,
    messages_published: AtomicU64,
    subscribers_dropped: AtomicU64,
}

impl EventBus {
    pub fn new(config: BusConfig, ws_port: u16) -> Self {
        EventBus {
            config,
            ws_port,
            subscribers: DashMap::new(),
            messages_published: AtomicU64::new(0),
            subscribers_dropped: AtomicU64::new(0),
        }
    }

    /// Broadcast a message to all subscribers. Never blocks: a
    /// subscriber whose queue is full is disconnected instead.
    pub fn publish(&self, message: &BusMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to serialize bus message: {}", e);
                return;
            }
        };

        let mut dropped = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().tx.try_send(Message::Text(text.clone())).is_err() {
                dropped.push(entry.key().clone());
            }
        }
        for subscriber_id in dropped {
            if let Some((_, subscriber)) = self.subscribers.remove(&subscriber_id) {
                warn!(
                    subscriber_id = %subscriber_id,
                    resolver_id = ?subscriber.resolver_id,
                    "dropping slow subscriber"
                );
            }
            self.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn subscribers_dropped(&self) -> u64 {
        self.subscribers_dropped.load(Ordering::Relaxed)
    }

    /// Start accepting WebSocket connections.
    pub async fn start(
        self: &Arc<Self>,
        engine: AuctionHandle,
        shutdown: broadcast::Sender<()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.ws_port)).await?;
        info!("event bus listening on ws port {}", self.ws_port);

        let bus = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("new bus connection from {}", addr);
                                let bus = Arc::clone(&bus);
                                let engine = engine.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = bus.handle_connection(stream, engine).await {
                                        debug!("bus connection ended: {}", e);
                                    }
                                });
                            }
                            Err(e) => error!("failed to accept bus connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("event bus shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        engine: AuctionHandle,
    ) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4().to_string();

        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_depth);

        // Writer task: the only place that touches the sink. Both
        // broadcasts and direct replies ride the same bounded queue.
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        let mut subscribed = false;
        while let Some(frame) = ws_receiver.next().await {
            let frame = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(_) => break,
            };

            match serde_json::from_str::<ClientFrame>(&frame) {
                Ok(ClientFrame::Subscribe { resolver_id }) => {
                    if !subscribed {
                        if self.subscribers.len() >= self.config.max_subscribers {
                            self.reply(
                                &tx,
                                &ServerFrame::Error {
                                    code: "subscriber_limit".to_string(),
                                    message: "subscriber table full".to_string(),
                                },
                            )
                            .await;
                            break;
                        }
                        self.subscribers.insert(
                            connection_id.clone(),
                            Subscriber {
                                tx: tx.clone(),
                                resolver_id: resolver_id.clone(),
                            },
                        );
                        subscribed = true;
                        info!(
                            subscriber_id = %connection_id,
                            resolver_id = ?resolver_id,
                            "subscriber registered"
                        );
                    }
                    self.reply(
                        &tx,
                        &ServerFrame::Subscribed {
                            subscriber_id: connection_id.clone(),
                        },
                    )
                    .await;
                }
                Ok(ClientFrame::SnapshotRequest {}) => {
                    let auctions = engine.snapshot().await.unwrap_or_default();
                    self.reply(&tx, &ServerFrame::Snapshot { auctions }).await;
                }
                Ok(ClientFrame::Claim {
                    order_id,
                    segment_id,
                    resolver_id,
                }) => {
                    let result = engine.claim(&order_id, segment_id, &resolver_id).await;
                    let frame = match result {
                        Ok(accepted) => ServerFrame::ClaimResult {
                            order_id,
                            segment_id,
                            accepted: true,
                            code: None,
                            winning_price: Some(accepted.winning_price),
                        },
                        Err(e) => ServerFrame::ClaimResult {
                            order_id,
                            segment_id,
                            accepted: false,
                            code: Some(e.code().to_string()),
                            winning_price: None,
                        },
                    };
                    self.reply(&tx, &frame).await;
                }
                Err(e) => {
                    debug!("rejecting unknown bus frame: {}", e);
                    self.reply(
                        &tx,
                        &ServerFrame::Error {
                            code: "unknown_message".to_string(),
                            message: format!("unrecognized frame: {}", e),
                        },
                    )
                    .await;
                }
            }
        }

        self.subscribers.remove(&connection_id);
        writer.abort();
        debug!(subscriber_id = %connection_id, "bus connection closed");
        Ok(())
    }

    /// Direct reply on the connection's own queue. Awaiting here only
    /// ever blocks this connection's read loop, never the publisher.
    async fn reply(&self, tx: &mpsc::Sender<Message>, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = tx.send(Message::Text(text)).await;
            }
            Err(e) => error!("failed to serialize server frame: {}", e),
        }
    }
}
