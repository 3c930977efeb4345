//! Swap orchestration against a scripted coordinator and recording
//! chain drivers: step ordering, escrow parameterization, and the
//! verification-gated secret wait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crosslock_resolver::chain::{
    AccountEffect, ChainDriver, ChainError, EscrowAction, ObservedTransfer, TxOutcome,
};
use crosslock_resolver::config::{ResolverConfig, TimelockOffsets};
use crosslock_resolver::coordinator::{ClientError, CoordinatorApi, SecretOutcome};
use crosslock_resolver::swap::{SwapError, SwapOrchestrator};
use hashlock::{hash_leaf, HexBytes32};
use rust_decimal_macros::dec;
use swap_protocols::{
    EscrowSide, Order, OrderKind, OrderStatus, ProgressRequest, RequestSecretRequest,
};
use tokio::sync::Mutex;

/// Records every capability call; escrow creations return predictable
/// addresses.
struct RecordingDriver {
    chain_id: String,
    account: String,
    calls: Arc<Mutex<Vec<String>>>,
    specs: Arc<Mutex<Vec<EscrowAction>>>,
}

impl RecordingDriver {
    fn new(chain_id: &str, account: &str, calls: Arc<Mutex<Vec<String>>>) -> Self {
        RecordingDriver {
            chain_id: chain_id.to_string(),
            account: account.to_string(),
            calls,
            specs: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl ChainDriver for RecordingDriver {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn account(&self) -> &str {
        &self.account
    }

    async fn approve(&self, token: &str, amount: u128) -> Result<TxOutcome, ChainError> {
        self.calls
            .lock()
            .await
            .push(format!("{}:approve:{}:{}", self.chain_id, token, amount));
        Ok(TxOutcome {
            tx_hash: "0xapprove".into(),
            escrow_address: None,
        })
    }

    async fn transfer(
        &self,
        token: &str,
        to: &str,
        amount: u128,
    ) -> Result<TxOutcome, ChainError> {
        self.calls
            .lock()
            .await
            .push(format!("{}:transfer:{}:{}:{}", self.chain_id, token, to, amount));
        Ok(TxOutcome {
            tx_hash: "0xtransfer".into(),
            escrow_address: None,
        })
    }

    async fn invoke(&self, action: &EscrowAction) -> Result<TxOutcome, ChainError> {
        let label = match action {
            EscrowAction::Create(spec) => format!("{}:create:{}", self.chain_id, spec.side),
            EscrowAction::Withdraw { proof, .. } => format!(
                "{}:withdraw:proof={}",
                self.chain_id,
                proof.as_ref().map(|p| p.len()).unwrap_or(0)
            ),
            EscrowAction::Cancel { .. } => format!("{}:cancel", self.chain_id),
        };
        self.calls.lock().await.push(label);
        self.specs.lock().await.push(action.clone());
        Ok(TxOutcome {
            tx_hash: format!("0xtx-{}", self.chain_id),
            escrow_address: Some(format!("escrow-{}", self.chain_id)),
        })
    }

    async fn observe_transfer_to(
        &self,
        _address: &str,
    ) -> Result<Vec<ObservedTransfer>, ChainError> {
        Ok(Vec::new())
    }

    async fn observe_account_effects(
        &self,
        _address: &str,
    ) -> Result<Vec<AccountEffect>, ChainError> {
        Ok(Vec::new())
    }
}

/// Scripted coordinator: serves one order, releases the secret after a
/// configurable number of pending responses, and records progress.
struct ScriptedCoordinator {
    order: Order,
    secret: hashlock::Bytes32,
    merkle_proof: Option<Vec<hashlock::Bytes32>>,
    pending_before_release: Mutex<u32>,
    progress: Mutex<Vec<String>>,
}

#[async_trait]
impl CoordinatorApi for ScriptedCoordinator {
    async fn get_order(&self, _order_id: &str) -> Result<Order, ClientError> {
        Ok(self.order.clone())
    }

    async fn request_secret(
        &self,
        _order_id: &str,
        _request: &RequestSecretRequest,
    ) -> Result<SecretOutcome, ClientError> {
        let mut remaining = self.pending_before_release.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(SecretOutcome::Pending("escrows not yet funded".into()));
        }
        Ok(SecretOutcome::Released {
            secret: self.secret,
            merkle_proof: self.merkle_proof.clone(),
        })
    }

    async fn notify_progress(
        &self,
        _order_id: &str,
        request: &ProgressRequest,
    ) -> Result<(), ClientError> {
        self.progress.lock().await.push(request.step.clone());
        Ok(())
    }
}

fn test_order(kind: OrderKind, hash_lock: hashlock::Bytes32) -> Order {
    Order {
        order_id: "ord-1".into(),
        kind,
        src_chain: "evm-sepolia".into(),
        dst_chain: "stellar-testnet".into(),
        src_token: "0xweth".into(),
        dst_token: "CXLM".into(),
        src_amount: 1_000,
        dst_amount: 39_000,
        market_price: dec!(3900),
        slippage: dec!(0.02),
        buyer_src_address: "0xbuyer".into(),
        buyer_dst_address: "GBUYER".into(),
        hash_lock: HexBytes32(hash_lock),
        status: OrderStatus::WinnerDeclared,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        segment_leaf_hashes: None,
        segments: Vec::new(),
        auction_snapshot: None,
        escrow_records: Vec::new(),
        progress_log: Vec::new(),
        winner: Some("res-test".into()),
        winning_price: Some(dec!(4011)),
    }
}

fn test_config() -> ResolverConfig {
    let mut config = ResolverConfig::default();
    config.resolver_id = "res-test".into();
    // Windows anchored in the past-adjacent present so the withdrawal
    // wait is a no-op in tests.
    config.timelocks = TimelockOffsets {
        withdrawal_secs: 0,
        public_withdrawal_secs: 60,
        cancellation_secs: 1_800,
        public_cancellation_secs: 3_600,
    };
    config.strategy.secret_retry_secs = 0;
    config.strategy.secret_max_retries = 5;
    config
}

struct Harness {
    orchestrator: SwapOrchestrator,
    coordinator: Arc<ScriptedCoordinator>,
    calls: Arc<Mutex<Vec<String>>>,
    src_driver: Arc<RecordingDriver>,
    dst_driver: Arc<RecordingDriver>,
}

fn harness(
    order: Order,
    secret: hashlock::Bytes32,
    merkle_proof: Option<Vec<hashlock::Bytes32>>,
    pending_before_release: u32,
) -> Harness {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let src_driver = Arc::new(RecordingDriver::new(
        "evm-sepolia",
        "0xresolver",
        Arc::clone(&calls),
    ));
    let dst_driver = Arc::new(RecordingDriver::new(
        "stellar-testnet",
        "GRESOLVER",
        Arc::clone(&calls),
    ));
    let mut drivers: HashMap<String, Arc<dyn ChainDriver>> = HashMap::new();
    drivers.insert(
        "evm-sepolia".into(),
        Arc::clone(&src_driver) as Arc<dyn ChainDriver>,
    );
    drivers.insert(
        "stellar-testnet".into(),
        Arc::clone(&dst_driver) as Arc<dyn ChainDriver>,
    );

    let coordinator = Arc::new(ScriptedCoordinator {
        order,
        secret,
        merkle_proof,
        pending_before_release: Mutex::new(pending_before_release),
        progress: Mutex::new(Vec::new()),
    });

    let orchestrator = SwapOrchestrator::new(
        test_config(),
        Arc::clone(&coordinator) as Arc<dyn CoordinatorApi>,
        drivers,
    );
    Harness {
        orchestrator,
        coordinator,
        calls,
        src_driver,
        dst_driver,
    }
}

#[tokio::test]
async fn test_single_swap_walks_all_steps_in_order() {
    let (secret, hash) = hashlock::mint_single();
    let h = harness(test_order(OrderKind::Single, hash), secret, None, 0);

    h.orchestrator.execute("ord-1", None).await.unwrap();

    let progress = h.coordinator.progress.lock().await.clone();
    assert_eq!(
        progress,
        vec![
            "prepared_src",
            "src_escrow_created",
            "dst_escrow_created",
            "awaiting_verification",
            "secret_received",
            "src_withdrawn",
            "dst_withdrawn",
            "completed",
        ]
    );

    let calls = h.calls.lock().await.clone();
    assert_eq!(
        calls,
        vec![
            "evm-sepolia:approve:0xweth:1000",
            "evm-sepolia:create:src",
            "stellar-testnet:approve:CXLM:39000",
            "stellar-testnet:create:dst",
            "evm-sepolia:withdraw:proof=0",
            "stellar-testnet:withdraw:proof=0",
        ]
    );
}

#[tokio::test]
async fn test_escrow_pair_shares_hashlock_and_windows() {
    let (secret, hash) = hashlock::mint_single();
    let h = harness(test_order(OrderKind::Single, hash), secret, None, 0);
    h.orchestrator.execute("ord-1", None).await.unwrap();

    let src_specs = h.src_driver.specs.lock().await.clone();
    let dst_specs = h.dst_driver.specs.lock().await.clone();
    let src_create = src_specs
        .iter()
        .find_map(|action| match action {
            EscrowAction::Create(spec) => Some(spec.clone()),
            _ => None,
        })
        .unwrap();
    let dst_create = dst_specs
        .iter()
        .find_map(|action| match action {
            EscrowAction::Create(spec) => Some(spec.clone()),
            _ => None,
        })
        .unwrap();

    // One hashlock, one set of windows, explicit side discriminators.
    assert_eq!(src_create.hash_lock, hash);
    assert_eq!(dst_create.hash_lock, hash);
    assert_eq!(src_create.timelocks, dst_create.timelocks);
    assert!(src_create.timelocks.validate().is_ok());
    assert_eq!(src_create.side, EscrowSide::Src);
    assert_eq!(dst_create.side, EscrowSide::Dst);

    // Src pays out to the resolver with the buyer as refund address;
    // dst pays out to the buyer.
    assert_eq!(src_create.recipient, "0xresolver");
    assert_eq!(src_create.buyer.as_deref(), Some("0xbuyer"));
    assert_eq!(dst_create.recipient, "GBUYER");
    assert!(dst_create.buyer.is_none());
}

#[tokio::test]
async fn test_secret_wait_retries_until_released() {
    let (secret, hash) = hashlock::mint_single();
    let h = harness(test_order(OrderKind::Single, hash), secret, None, 3);

    h.orchestrator.execute("ord-1", None).await.unwrap();
    // All pending responses were consumed before the release.
    assert_eq!(*h.coordinator.pending_before_release.lock().await, 0);
}

#[tokio::test]
async fn test_secret_wait_gives_up_after_max_retries() {
    let (secret, hash) = hashlock::mint_single();
    let h = harness(test_order(OrderKind::Single, hash), secret, None, 100);

    let err = h.orchestrator.execute("ord-1", None).await.unwrap_err();
    assert!(matches!(err, SwapError::SecretUnavailable { attempts: 5 }));

    // The failure leaves the flow parked after escrow creation: no
    // withdrawal steps were reported.
    let progress = h.coordinator.progress.lock().await.clone();
    assert!(progress.contains(&"awaiting_verification".to_string()));
    assert!(!progress.iter().any(|step| step.contains("withdrawn")));
}

#[tokio::test]
async fn test_segmented_swap_withdraws_with_proof() {
    let minted = hashlock::mint_segmented(4).unwrap();
    let mut order = test_order(OrderKind::Segmented, minted.root);
    order.segments = swap_protocols::segment_amounts(order.src_amount)
        .iter()
        .zip(swap_protocols::segment_start_prices(order.market_price))
        .enumerate()
        .map(|(index, (amount, start))| swap_protocols::Segment {
            id: index as u8 + 1,
            amount: *amount,
            start_price: start,
            end_price: dec!(3822),
            current_price: start,
            winner: if index == 1 { Some("res-test".into()) } else { None },
            status: swap_protocols::SegmentStatus::Active,
            leaf_hash: HexBytes32(minted.leaves[index]),
            merkle_proof: minted.proofs[index].iter().copied().map(HexBytes32).collect(),
        })
        .collect();

    let h = harness(order, minted.secrets[1], Some(minted.proofs[1].clone()), 0);

    h.orchestrator.execute("ord-1", Some(2)).await.unwrap();

    let calls = h.calls.lock().await.clone();
    // Segment 2 of a 1000/39000 order: 250 src, 9750 dst; withdrawals
    // carry the two-element Merkle proof.
    assert!(calls.contains(&"evm-sepolia:approve:0xweth:250".to_string()));
    assert!(calls.contains(&"stellar-testnet:approve:CXLM:9750".to_string()));
    assert!(calls.contains(&"evm-sepolia:withdraw:proof=2".to_string()));
    assert!(calls.contains(&"stellar-testnet:withdraw:proof=2".to_string()));

    // The released secret really is segment 2's leaf.
    assert_eq!(hash_leaf(&minted.secrets[1]), minted.leaves[1]);
}

#[tokio::test]
async fn test_cancel_after_window_opens() {
    let (secret, hash) = hashlock::mint_single();
    let mut order = test_order(OrderKind::Single, hash);
    // Escrows created two hours ago; the cancellation window (30 min
    // after creation in the test config) is long open.
    let created_at = Utc::now() - chrono::Duration::seconds(7_200);
    order.escrow_records = vec![
        swap_protocols::EscrowRecord {
            segment_id: None,
            side: EscrowSide::Src,
            address: "escrow-evm-sepolia".into(),
            creation_tx_hash: "0xaaa".into(),
            created_at,
            observed_funded_at: None,
            withdrawal_tx_hash: None,
        },
        swap_protocols::EscrowRecord {
            segment_id: None,
            side: EscrowSide::Dst,
            address: "escrow-stellar-testnet".into(),
            creation_tx_hash: "stellar-bbb".into(),
            created_at,
            observed_funded_at: None,
            withdrawal_tx_hash: None,
        },
    ];
    let h = harness(order, secret, None, 0);

    h.orchestrator
        .cancel("ord-1", None, "escrow-evm-sepolia", "escrow-stellar-testnet")
        .await
        .unwrap();

    let calls = h.calls.lock().await.clone();
    assert!(calls.contains(&"evm-sepolia:cancel".to_string()));
    assert!(calls.contains(&"stellar-testnet:cancel".to_string()));
    let progress = h.coordinator.progress.lock().await.clone();
    assert_eq!(progress, vec!["cancelled"]);
}

#[tokio::test]
async fn test_cancel_before_window_is_refused() {
    let (secret, hash) = hashlock::mint_single();
    let mut order = test_order(OrderKind::Single, hash);
    order.escrow_records = vec![swap_protocols::EscrowRecord {
        segment_id: None,
        side: EscrowSide::Src,
        address: "escrow-evm-sepolia".into(),
        creation_tx_hash: "0xaaa".into(),
        created_at: Utc::now(),
        observed_funded_at: None,
        withdrawal_tx_hash: None,
    }];
    let h = harness(order, secret, None, 0);

    let err = h
        .orchestrator
        .cancel("ord-1", None, "escrow-evm-sepolia", "escrow-stellar-testnet")
        .await
        .unwrap_err();
    assert!(matches!(err, SwapError::CancellationNotOpen { .. }));

    // Nothing was submitted on either chain.
    assert!(h.calls.lock().await.is_empty());
}

#[tokio::test]
async fn test_missing_driver_is_an_error() {
    let (secret, hash) = hashlock::mint_single();
    let mut order = test_order(OrderKind::Single, hash);
    order.src_chain = "unknown-chain".into();
    let h = harness(order, secret, None, 0);

    let err = h.orchestrator.execute("ord-1", None).await.unwrap_err();
    assert!(matches!(err, SwapError::NoDriver(chain) if chain == "unknown-chain"));
}
