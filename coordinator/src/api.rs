//! Relayer API: order admission, secret registration and release,
//! progress notifications, and queries.
//!
//! Error responses always carry a machine-readable code plus the
//! order's current status, so a client can re-drive itself without a
//! second round trip.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use hashlock::{build_tree, HexBytes32};
use swap_protocols::{
    segment_amounts, segment_start_prices, BusMessage, CreateOrderRequest,
    CreateOrderResponse, ErrorBody, EscrowCreatedPayload, EscrowRecord, EscrowSide, Order,
    OrderError, OrderFilter, OrderKind, OrderStatus, ProgressEntry, ProgressRequest,
    RegisterSecretRequest, RegisterSegmentSecretRequest, RequestSecretRequest,
    RequestSecretResponse, ResolverProgressPayload, SecretReleasedPayload, Segment, SegmentStatus,
    WithdrawalPayload, SEGMENT_COUNT,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::auction::AuctionHandle;
use crate::bus::EventBus;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::store::{OrderStore, StoreError};
use crate::vault::SecretVault;
use crate::verifier::{EscrowVerifier, VerificationRequest};

/// Everything the API handlers need, shared behind one Arc.
pub struct ApiContext {
    pub config: CoordinatorConfig,
    pub store: Arc<OrderStore>,
    pub vault: Arc<SecretVault>,
    pub verifier: Arc<EscrowVerifier>,
    pub engine: AuctionHandle,
    pub bus: Arc<EventBus>,
    pub started_at: chrono::DateTime<Utc>,
}

/// API-facing error: the coordinator error plus the order's current
/// status when one is known.
pub struct ApiError {
    error: CoordinatorError,
    order_status: Option<OrderStatus>,
}

impl ApiError {
    fn with_status(error: CoordinatorError, order_status: Option<OrderStatus>) -> Self {
        ApiError { error, order_status }
    }
}

impl<E: Into<CoordinatorError>> From<E> for ApiError {
    fn from(error: E) -> Self {
        ApiError {
            error: error.into(),
            order_status: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            code: self.error.code().to_string(),
            message: self.error.to_string(),
            order_status: self.order_status,
        };
        (status, Json(body)).into_response()
    }
}

/// Relayer API server.
pub struct ApiServer {
    context: Arc<ApiContext>,
}

impl ApiServer {
    pub fn new(context: Arc<ApiContext>) -> Self {
        ApiServer { context }
    }

    /// Build the router; shared by the server and tests.
    pub fn router(context: Arc<ApiContext>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/stats", get(stats))
            .route("/orders", post(create_order).get(list_orders))
            .route("/orders/:order_id", get(get_order))
            .route("/orders/:order_id/secret", post(register_secret))
            .route("/orders/:order_id/segment-secret", post(register_segment_secret))
            .route("/orders/:order_id/request-secret", post(request_secret))
            .route("/orders/:order_id/progress", post(notify_progress))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(context)
    }

    /// Serve until the shutdown signal fires.
    pub async fn start(&self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let app = Self::router(Arc::clone(&self.context));
        let addr = format!("0.0.0.0:{}", self.context.config.api_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("relayer API listening on http://{}", addr);

        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = axum::serve(listener, app) => {
                    if let Err(e) = result {
                        error!("relayer API server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("relayer API shutting down");
                }
            }
        });

        Ok(())
    }
}

async fn health(State(context): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "crosslock-coordinator",
        "nodeId": context.config.node_id,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn stats(State(context): State<Arc<ApiContext>>) -> Result<impl IntoResponse, ApiError> {
    let orders = context.store.scan(&OrderFilter::default()).await;
    let active_auctions = context.engine.snapshot().await?.len();
    let releases = context.vault.release_log().await.len();
    let uptime = (Utc::now() - context.started_at).num_seconds().max(0);

    let mut by_status = std::collections::BTreeMap::new();
    for order in &orders {
        *by_status.entry(order.status.to_string()).or_insert(0u64) += 1;
    }

    Ok(Json(serde_json::json!({
        "ordersTotal": orders.len(),
        "ordersByStatus": by_status,
        "activeAuctions": active_auctions,
        "secretsReleased": releases,
        "subscribers": context.bus.subscriber_count(),
        "messagesPublished": context.bus.messages_published(),
        "subscribersDropped": context.bus.subscribers_dropped(),
        "uptimeSeconds": uptime,
    })))
}

async fn create_order(
    State(context): State<Arc<ApiContext>>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    validate_order_request(&request)?;

    let order_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let end = swap_protocols::end_price(request.market_price, request.slippage);

    let (hash_lock, segments, segment_leaf_hashes) = match request.kind {
        OrderKind::Single => {
            let hash_lock = match request.hash_lock {
                Some(provided) => provided,
                None => {
                    let (secret, hash) = hashlock::mint_single();
                    context.vault.store_single(&order_id, secret).await;
                    HexBytes32(hash)
                }
            };
            (hash_lock, Vec::new(), None)
        }
        OrderKind::Segmented => {
            let (root, leaves, proofs) = match (&request.hash_lock, &request.segment_leaf_hashes) {
                (Some(root), Some(leaves)) => {
                    let raw: Vec<hashlock::Bytes32> = leaves.iter().map(|l| l.0).collect();
                    let tree = build_tree(&raw).map_err(CoordinatorError::Hashlock)?;
                    if tree.root != root.0 {
                        return Err(OrderError::MalformedRequest(
                            "hashLock does not match the segment leaf set".to_string(),
                        )
                        .into());
                    }
                    (*root, leaves.clone(), tree.proofs)
                }
                (None, None) => {
                    let minted = hashlock::mint_segmented(SEGMENT_COUNT as usize)
                        .map_err(CoordinatorError::Hashlock)?;
                    context.vault.store_segmented(&order_id, &minted.secrets).await;
                    (
                        HexBytes32(minted.root),
                        minted.leaves.iter().copied().map(HexBytes32).collect(),
                        minted.proofs,
                    )
                }
                _ => {
                    return Err(OrderError::MalformedRequest(
                        "segmented orders need both hashLock and segmentLeafHashes, or neither"
                            .to_string(),
                    )
                    .into());
                }
            };

            let amounts = segment_amounts(request.src_amount);
            let starts = segment_start_prices(request.market_price);
            let segments = amounts
                .iter()
                .zip(starts.iter())
                .zip(leaves.iter().zip(proofs.iter()))
                .enumerate()
                .map(|(index, ((amount, start), (leaf, proof)))| Segment {
                    id: index as u8 + 1,
                    amount: *amount,
                    start_price: *start,
                    end_price: end,
                    current_price: *start,
                    winner: None,
                    status: SegmentStatus::Active,
                    leaf_hash: *leaf,
                    merkle_proof: proof.iter().copied().map(HexBytes32).collect(),
                })
                .collect();
            (root, segments, Some(leaves))
        }
    };

    let order = Order {
        order_id: order_id.clone(),
        kind: request.kind,
        src_chain: request.src_chain,
        dst_chain: request.dst_chain,
        src_token: request.src_token,
        dst_token: request.dst_token,
        src_amount: request.src_amount,
        dst_amount: request.dst_amount,
        market_price: request.market_price,
        slippage: request.slippage,
        buyer_src_address: request.buyer_src_address,
        buyer_dst_address: request.buyer_dst_address,
        hash_lock,
        status: OrderStatus::Pending,
        created_at: now,
        updated_at: now,
        segment_leaf_hashes,
        segments,
        auction_snapshot: None,
        escrow_records: Vec::new(),
        progress_log: Vec::new(),
        winner: None,
        winning_price: None,
    };

    context.store.put(order).await.map_err(CoordinatorError::Store)?;
    info!(order_id = %order_id, "order admitted");

    // Admission is asynchronous: the order is persisted as pending and
    // the auction opens right after the response goes out.
    let engine = context.engine.clone();
    let admit_id = order_id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.admit(&admit_id).await {
            error!(order_id = %admit_id, "auction admission failed: {}", e);
        }
    });

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order_id,
            status: OrderStatus::Pending,
        }),
    ))
}

fn validate_order_request(request: &CreateOrderRequest) -> Result<(), ApiError> {
    if request.src_amount == 0 || request.dst_amount == 0 {
        return Err(OrderError::MalformedRequest("amounts must be positive".to_string()).into());
    }
    if request.market_price <= rust_decimal::Decimal::ZERO {
        return Err(
            OrderError::MalformedRequest("marketPrice must be positive".to_string()).into(),
        );
    }
    if request.slippage < rust_decimal::Decimal::ZERO
        || request.slippage >= rust_decimal::Decimal::ONE
    {
        return Err(OrderError::MalformedRequest("slippage must be in [0, 1)".to_string()).into());
    }
    if let Some(leaves) = &request.segment_leaf_hashes {
        if leaves.len() != SEGMENT_COUNT as usize {
            return Err(OrderError::MalformedRequest(format!(
                "expected {} segment leaf hashes, got {}",
                SEGMENT_COUNT,
                leaves.len()
            ))
            .into());
        }
    }
    Ok(())
}

async fn get_order(
    State(context): State<Arc<ApiContext>>,
    Path(order_id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order = context
        .store
        .get(&order_id)
        .await
        .map_err(CoordinatorError::Store)?;
    Ok(Json(order))
}

async fn list_orders(
    State(context): State<Arc<ApiContext>>,
    Query(filter): Query<OrderFilter>,
) -> Result<Json<Vec<Order>>, ApiError> {
    Ok(Json(context.store.scan(&filter).await))
}

async fn register_secret(
    State(context): State<Arc<ApiContext>>,
    Path(order_id): Path<String>,
    Json(request): Json<RegisterSecretRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let order = context
        .store
        .get(&order_id)
        .await
        .map_err(CoordinatorError::Store)?;
    if order.status.is_terminal() {
        return Err(ApiError::with_status(
            OrderError::TerminalOrder(order_id).into(),
            Some(order.status),
        ));
    }
    if order.kind != OrderKind::Single {
        return Err(OrderError::MalformedRequest(
            "segmented orders register per-segment secrets".to_string(),
        )
        .into());
    }
    if request.hash_lock != order.hash_lock {
        return Err(OrderError::MalformedRequest(
            "hashLock does not match the order".to_string(),
        )
        .into());
    }
    context
        .vault
        .register_single(&order_id, request.secret.0, &order.hash_lock.0)
        .await
        .map_err(CoordinatorError::Vault)?;
    Ok(Json(serde_json::json!({ "registered": true })))
}

async fn register_segment_secret(
    State(context): State<Arc<ApiContext>>,
    Path(order_id): Path<String>,
    Json(request): Json<RegisterSegmentSecretRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let order = context
        .store
        .get(&order_id)
        .await
        .map_err(CoordinatorError::Store)?;
    if order.status.is_terminal() {
        return Err(ApiError::with_status(
            OrderError::TerminalOrder(order_id).into(),
            Some(order.status),
        ));
    }
    let segment = order.segment(request.segment_id)?;
    if request.leaf_hash != segment.leaf_hash {
        return Err(OrderError::MalformedRequest(
            "leafHash does not match the segment".to_string(),
        )
        .into());
    }
    context
        .vault
        .register_segment(&order_id, request.segment_id, request.secret.0, &segment.leaf_hash.0)
        .await
        .map_err(CoordinatorError::Vault)?;
    Ok(Json(serde_json::json!({ "registered": true })))
}

async fn request_secret(
    State(context): State<Arc<ApiContext>>,
    Path(order_id): Path<String>,
    Json(request): Json<RequestSecretRequest>,
) -> Result<Json<RequestSecretResponse>, ApiError> {
    let order = context
        .store
        .get(&order_id)
        .await
        .map_err(CoordinatorError::Store)?;
    if order.status.is_terminal() {
        return Err(ApiError::with_status(
            OrderError::TerminalOrder(order_id).into(),
            Some(order.status),
        ));
    }

    // Only the declared winner of the scope may obtain the secret.
    let scope_winner = match request.segment_id {
        Some(segment_id) => order.segment(segment_id)?.winner.clone(),
        None => order.winner.clone(),
    };
    match scope_winner {
        None => {
            return Err(ApiError::with_status(
                CoordinatorError::AuctionNotActive {
                    order_id: order.order_id.clone(),
                },
                Some(order.status),
            ));
        }
        Some(winner) if winner != request.resolver_id => {
            return Err(ApiError::with_status(
                CoordinatorError::NotWinner {
                    resolver_id: request.resolver_id,
                    order_id: order.order_id.clone(),
                },
                Some(order.status),
            ));
        }
        Some(_) => {}
    }

    let src_amount = order.scope_amount(request.segment_id)?;
    let dst_amount = match request.segment_id {
        Some(segment_id) => segment_amounts(order.dst_amount)[segment_id as usize - 1],
        None => order.dst_amount,
    };
    let verification = VerificationRequest {
        order_id: order.order_id.clone(),
        segment_id: request.segment_id,
        src_chain: request.source_chain.clone(),
        dst_chain: request.destination_chain.clone(),
        src_escrow_address: request.src_escrow_address.clone(),
        dst_escrow_address: request.dst_escrow_address.clone(),
        src_amount,
        dst_amount,
    };

    let report = context
        .verifier
        .verify(&verification)
        .await
        .map_err(|e| ApiError::with_status(CoordinatorError::Verifier(e), Some(order.status)))?;
    if !report.verified {
        let reason = format!(
            "src funded: {}, dst funded: {}",
            report.src.funded, report.dst.funded
        );
        return Err(ApiError::with_status(
            CoordinatorError::Verifier(crate::verifier::VerifierError::Pending { reason }),
            Some(order.status),
        ));
    }

    context
        .vault
        .mark_verified(&order_id, request.segment_id)
        .await;
    let secret = context
        .vault
        .release(&order_id, request.segment_id, &request.resolver_id)
        .await
        .map_err(|e| ApiError::with_status(CoordinatorError::Vault(e), Some(order.status)))?;

    // Record funding evidence and advance the order if this was the
    // first release after both escrows appeared.
    let funded_at = Utc::now();
    let segment_id = request.segment_id;
    let src_address = request.src_escrow_address.clone();
    let dst_address = request.dst_escrow_address.clone();
    let updated = context
        .store
        .update(&order_id, move |order| {
            for record in order.escrow_records.iter_mut() {
                let matches_side = match record.side {
                    EscrowSide::Src => record.address == src_address,
                    EscrowSide::Dst => record.address == dst_address,
                };
                if record.segment_id == segment_id && matches_side {
                    record.observed_funded_at = Some(funded_at);
                }
            }
            if order.status == OrderStatus::DstEscrowCreated {
                order.status = OrderStatus::SecretRequested;
            }
            Ok(())
        })
        .await
        .map_err(CoordinatorError::Store)?;

    context.bus.publish(&BusMessage::SecretReleased {
        order_id: order_id.clone(),
        segment_id: request.segment_id,
        ts: Utc::now(),
        payload: SecretReleasedPayload {
            released_to: request.resolver_id.clone(),
        },
    });
    info!(
        order_id = %order_id,
        segment_id = ?request.segment_id,
        resolver_id = %request.resolver_id,
        status = %updated.status,
        "secret released to resolver"
    );

    let merkle_proof = match request.segment_id {
        Some(segment_id) => Some(updated.segment(segment_id)?.merkle_proof.clone()),
        None => None,
    };
    Ok(Json(RequestSecretResponse {
        secret: HexBytes32(secret),
        merkle_proof,
    }))
}

/// Position of a status along the forward swap path; used to ignore
/// progress notifications that arrive behind the current status.
fn status_rank(status: OrderStatus) -> Option<u8> {
    match status {
        OrderStatus::Pending => Some(0),
        OrderStatus::AuctionActive => Some(1),
        OrderStatus::WinnerDeclared => Some(2),
        OrderStatus::SrcEscrowCreated => Some(3),
        OrderStatus::DstEscrowCreated => Some(4),
        OrderStatus::SecretRequested => Some(5),
        OrderStatus::SrcWithdrawn => Some(6),
        OrderStatus::DstWithdrawn => Some(7),
        OrderStatus::Completed => Some(8),
        OrderStatus::Expired | OrderStatus::Cancelled => None,
    }
}

fn status_for_step(step: &str) -> Option<OrderStatus> {
    match step {
        "src_escrow_created" => Some(OrderStatus::SrcEscrowCreated),
        "dst_escrow_created" => Some(OrderStatus::DstEscrowCreated),
        "src_withdrawn" => Some(OrderStatus::SrcWithdrawn),
        "dst_withdrawn" => Some(OrderStatus::DstWithdrawn),
        "completed" => Some(OrderStatus::Completed),
        "cancelled" => Some(OrderStatus::Cancelled),
        _ => None,
    }
}

async fn notify_progress(
    State(context): State<Arc<ApiContext>>,
    Path(order_id): Path<String>,
    Json(request): Json<ProgressRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let order = context
        .store
        .get(&order_id)
        .await
        .map_err(CoordinatorError::Store)?;
    if order.status.is_terminal() {
        return Err(ApiError::with_status(
            OrderError::TerminalOrder(order_id).into(),
            Some(order.status),
        ));
    }

    let entry = ProgressEntry {
        step: request.step.clone(),
        details: request.details.clone(),
        segment_id: request.segment_id,
        resolver_id: request.resolver_id.clone(),
        ts: Utc::now(),
    };

    let target = status_for_step(&request.step);
    let step = request.step.clone();
    let details = request.details.clone();
    let segment_id = request.segment_id;
    let updated = context
        .store
        .update(&order_id, move |order| {
            order.progress_log.push(entry);

            if let Some(target) = target {
                match (status_rank(order.status), status_rank(target)) {
                    // Forward progress only; notifications behind the
                    // current status are recorded but change nothing.
                    (Some(current), Some(wanted)) if wanted > current => {
                        order.status.ensure_transition(target)?;
                        order.status = target;
                    }
                    // Cancellation has no forward rank; the DAG decides
                    // whether it is still reachable.
                    (Some(_), None) => {
                        order.status.ensure_transition(target)?;
                        order.status = target;
                    }
                    _ => {}
                }
            }

            // Escrow breadcrumbs carry the on-chain artifacts.
            match step.as_str() {
                "src_escrow_created" | "dst_escrow_created" => {
                    let side = if step.starts_with("src") {
                        EscrowSide::Src
                    } else {
                        EscrowSide::Dst
                    };
                    let address = details
                        .get("address")
                        .and_then(|a| a.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let tx_hash = details
                        .get("txHash")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string();
                    order.escrow_records.push(EscrowRecord {
                        segment_id,
                        side,
                        address,
                        creation_tx_hash: tx_hash,
                        created_at: Utc::now(),
                        observed_funded_at: None,
                        withdrawal_tx_hash: None,
                    });
                }
                "src_withdrawn" | "dst_withdrawn" => {
                    let side = if step.starts_with("src") {
                        EscrowSide::Src
                    } else {
                        EscrowSide::Dst
                    };
                    let tx_hash = details
                        .get("txHash")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string();
                    for record in order.escrow_records.iter_mut() {
                        if record.segment_id == segment_id && record.side == side {
                            record.withdrawal_tx_hash = Some(tx_hash.clone());
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        })
        .await
        .map_err(|e| {
            let status = match &e {
                StoreError::Transition(_) => Some(order.status),
                _ => None,
            };
            ApiError::with_status(CoordinatorError::Store(e), status)
        })?;

    // Broadcast the breadcrumb, plus a typed event for escrow and
    // withdrawal milestones.
    let resolver_id = request.resolver_id.clone().unwrap_or_default();
    context.bus.publish(&BusMessage::ResolverProgress {
        order_id: order_id.clone(),
        segment_id: request.segment_id,
        ts: Utc::now(),
        payload: ResolverProgressPayload {
            resolver_id: resolver_id.clone(),
            step: request.step.clone(),
            details: request.details.clone(),
        },
    });
    match request.step.as_str() {
        "src_escrow_created" | "dst_escrow_created" => {
            let side = if request.step.starts_with("src") {
                EscrowSide::Src
            } else {
                EscrowSide::Dst
            };
            context.bus.publish(&BusMessage::EscrowCreated {
                order_id: order_id.clone(),
                segment_id: request.segment_id,
                ts: Utc::now(),
                payload: EscrowCreatedPayload {
                    side,
                    address: request
                        .details
                        .get("address")
                        .and_then(|a| a.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    tx_hash: request
                        .details
                        .get("txHash")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
            });
        }
        "src_withdrawn" | "dst_withdrawn" => {
            let side = if request.step.starts_with("src") {
                EscrowSide::Src
            } else {
                EscrowSide::Dst
            };
            context.bus.publish(&BusMessage::WithdrawalCompleted {
                order_id: order_id.clone(),
                segment_id: request.segment_id,
                ts: Utc::now(),
                payload: WithdrawalPayload {
                    side,
                    tx_hash: request
                        .details
                        .get("txHash")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
            });
        }
        _ => {}
    }

    Ok(Json(serde_json::json!({
        "recorded": true,
        "status": updated.status,
    })))
}
