//! End-to-end swap flows over a scripted chain client pair

use htlc_relayer::chain::{
    AdapterPolicy, ChainAction, ChainAdapter, ChainClient, ChainManager, FeeQuote, HtlcView,
    OrderView, SubmissionReceipt,
};
use htlc_relayer::config::RelayerConfig;
use htlc_relayer::events::{ChainEvent, EventPayload};
use htlc_relayer::ingest::EventIngestor;
use htlc_relayer::resolver::order::{
    generate_secret, hashlock_of, HtlcPhase, OrderState,
};
use htlc_relayer::resolver::{OrderStore, Resolver};
use htlc_relayer::state::{MemoryStateStore, StateStore};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256, U256};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

const CHAIN_A: u64 = 1;
const CHAIN_B: u64 = 2;

// ----------------------------------------------------------------------
// Scripted chain client
// ----------------------------------------------------------------------

struct MockChainClient {
    chain_id: u64,
    relayer: Address,
    tip: AtomicU64,
    events: Mutex<Vec<ChainEvent>>,
    submitted: Mutex<Vec<ChainAction>>,
    htlc_views: Mutex<HashMap<[u8; 32], HtlcView>>,
    order_views: Mutex<HashMap<[u8; 32], OrderView>>,
    tx_counter: AtomicU64,
}

impl MockChainClient {
    fn new(chain_id: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            relayer: Address::repeat_byte(chain_id as u8),
            tip: AtomicU64::new(1_000),
            events: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            htlc_views: Mutex::new(HashMap::new()),
            order_views: Mutex::new(HashMap::new()),
            tx_counter: AtomicU64::new(0),
        })
    }

    fn push_event(&self, event: ChainEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn set_tip(&self, height: u64) {
        self.tip.store(height, Ordering::Relaxed);
    }

    fn submitted_actions(&self) -> Vec<ChainAction> {
        self.submitted.lock().unwrap().clone()
    }

    fn count_actions(&self, pred: impl Fn(&ChainAction) -> bool) -> usize {
        self.submitted.lock().unwrap().iter().filter(|a| pred(a)).count()
    }

    fn set_htlc_view(&self, htlc_id: [u8; 32], view: HtlcView) {
        self.htlc_views.lock().unwrap().insert(htlc_id, view);
    }

    fn set_order_view(&self, order_hash: [u8; 32], view: OrderView) {
        self.order_views.lock().unwrap().insert(order_hash, view);
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn relayer_address(&self) -> Address {
        self.relayer
    }

    async fn tip_height(&self) -> htlc_relayer::error::RelayerResult<u64> {
        Ok(self.tip.load(Ordering::Relaxed))
    }

    async fn query_events(
        &self,
        from: u64,
        to: u64,
    ) -> htlc_relayer::error::RelayerResult<Vec<ChainEvent>> {
        let mut events: Vec<ChainEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block_number >= from && e.block_number <= to)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn estimate_gas(
        &self,
        _action: &ChainAction,
    ) -> htlc_relayer::error::RelayerResult<U256> {
        Ok(U256::from(50_000))
    }

    async fn submit(
        &self,
        action: &ChainAction,
        _gas_limit: U256,
        _fee: &FeeQuote,
    ) -> htlc_relayer::error::RelayerResult<H256> {
        self.submitted.lock().unwrap().push(action.clone());
        let n = self.tx_counter.fetch_add(1, Ordering::Relaxed);
        Ok(H256::from_low_u64_be((self.chain_id << 32) | n))
    }

    async fn tx_receipt(
        &self,
        tx_hash: H256,
    ) -> htlc_relayer::error::RelayerResult<Option<SubmissionReceipt>> {
        Ok(Some(SubmissionReceipt {
            tx_hash,
            block_number: self.tip.load(Ordering::Relaxed),
            success: true,
        }))
    }

    async fn fee_quote(&self) -> htlc_relayer::error::RelayerResult<FeeQuote> {
        Ok(FeeQuote::Legacy(U256::from(1_000_000_000u64)))
    }

    async fn order_view(
        &self,
        order_hash: [u8; 32],
    ) -> htlc_relayer::error::RelayerResult<Option<OrderView>> {
        Ok(self.order_views.lock().unwrap().get(&order_hash).cloned())
    }

    async fn htlc_view(
        &self,
        htlc_id: [u8; 32],
    ) -> htlc_relayer::error::RelayerResult<Option<HtlcView>> {
        Ok(self.htlc_views.lock().unwrap().get(&htlc_id).cloned())
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    chain_a: Arc<MockChainClient>,
    chain_b: Arc<MockChainClient>,
    chains: Arc<ChainManager>,
    resolver: Arc<Resolver>,
    state: Arc<MemoryStateStore>,
}

fn test_policy() -> AdapterPolicy {
    AdapterPolicy {
        confirmation_depth: 3,
        max_blocks_per_query: 100,
        retry_attempts: 3,
        retry_base_delay: Duration::from_millis(10),
        query_deadline: Duration::from_secs(5),
        receipt_deadline: Duration::from_secs(5),
        min_gas_limit: 100_000,
        max_inflight_submissions: 16,
    }
}

fn test_config() -> RelayerConfig {
    toml::from_str("instance_id = \"test\"").unwrap()
}

async fn harness() -> Harness {
    let chain_a = MockChainClient::new(CHAIN_A);
    let chain_b = MockChainClient::new(CHAIN_B);

    let client_a: Arc<dyn ChainClient> = chain_a.clone();
    let client_b: Arc<dyn ChainClient> = chain_b.clone();
    let adapter_a = Arc::new(ChainAdapter::new("chain_a", client_a, test_policy(), true));
    let adapter_b = Arc::new(ChainAdapter::new("chain_b", client_b, test_policy(), true));
    let chains = Arc::new(ChainManager::from_adapters(vec![adapter_a, adapter_b]));

    let state = Arc::new(MemoryStateStore::new());
    let state_dyn: Arc<dyn StateStore> = state.clone();
    let store = Arc::new(OrderStore::new(1000));
    let resolver = Resolver::new(chains.clone(), store, state_dyn, test_config());
    resolver.clone().spawn_workers(2).await;

    Harness {
        chain_a,
        chain_b,
        chains,
        resolver,
        state,
    }
}

// Event builders. `seq` must be unique per event so redeliveries can be
// expressed by reusing a sequence number.

fn ev(chain_id: u64, block: u64, seq: u64, payload: EventPayload) -> ChainEvent {
    ChainEvent {
        chain_id,
        block_number: block,
        tx_hash: H256::from_low_u64_be(seq),
        log_index: 0,
        payload,
    }
}

struct SwapFixture {
    order_hash: [u8; 32],
    secret: [u8; 32],
    hashlock: [u8; 32],
    timelock_src: u64,
    timelock_tgt: u64,
    maker: Address,
    user: Address,
    amount_in: U256,
    amount_out: U256,
    htlc_a: [u8; 32],
    htlc_b: [u8; 32],
}

fn fixture(n: u8) -> SwapFixture {
    let now = Utc::now().timestamp() as u64;
    let secret = generate_secret();
    SwapFixture {
        order_hash: [n; 32],
        secret,
        hashlock: hashlock_of(&secret),
        timelock_src: now + 86_400,
        timelock_tgt: now + 43_200,
        maker: Address::repeat_byte(0x11),
        user: Address::repeat_byte(0x22),
        amount_in: U256::exp10(18),
        amount_out: U256::exp10(18) * 98 / 100,
        htlc_a: [n.wrapping_add(0x40); 32],
        htlc_b: [n.wrapping_add(0x80); 32],
    }
}

impl SwapFixture {
    fn order_created(&self, seq: u64) -> ChainEvent {
        ev(
            CHAIN_A,
            900,
            seq,
            EventPayload::OrderCreated {
                order_hash: self.order_hash,
                maker: self.maker,
                receiver: self.user,
                token_in: Address::zero(),
                token_out: Address::zero(),
                amount_in: self.amount_in,
                amount_out: self.amount_out,
                hashlock: self.hashlock,
                timelock: self.timelock_src,
                target_chain_id: CHAIN_B,
            },
        )
    }

    /// Source HTLC names the relayer as receiver: it claims with the
    /// revealed secret
    fn htlc_created_a(&self, seq: u64, relayer: Address) -> ChainEvent {
        ev(
            CHAIN_A,
            901,
            seq,
            EventPayload::HtlcCreated {
                htlc_id: self.htlc_a,
                sender: self.maker,
                receiver: relayer,
                token: Address::zero(),
                amount: self.amount_in,
                hashlock: self.hashlock,
                timelock: self.timelock_src,
            },
        )
    }

    fn htlc_created_b(&self, seq: u64) -> ChainEvent {
        ev(
            CHAIN_B,
            500,
            seq,
            EventPayload::HtlcCreated {
                htlc_id: self.htlc_b,
                sender: Address::repeat_byte(0x33),
                receiver: self.user,
                token: Address::zero(),
                amount: self.amount_out,
                hashlock: self.hashlock,
                timelock: self.timelock_tgt,
            },
        )
    }

    fn htlc_claimed(&self, chain_id: u64, seq: u64, secret: [u8; 32]) -> ChainEvent {
        let htlc_id = if chain_id == CHAIN_A {
            self.htlc_a
        } else {
            self.htlc_b
        };
        ev(chain_id, 902, seq, EventPayload::HtlcClaimed { htlc_id, secret })
    }

    fn htlc_refunded(&self, chain_id: u64, seq: u64) -> ChainEvent {
        let htlc_id = if chain_id == CHAIN_A {
            self.htlc_a
        } else {
            self.htlc_b
        };
        ev(chain_id, 903, seq, EventPayload::HtlcRefunded { htlc_id })
    }
}

async fn order_state(h: &Harness, hash: &[u8; 32]) -> Option<OrderState> {
    match h.resolver.store().get(hash) {
        Some(slot) => Some(slot.lock().await.state),
        None => None,
    }
}

async fn wait_for_state(h: &Harness, hash: &[u8; 32], expected: OrderState) {
    for _ in 0..300 {
        if order_state(h, hash).await == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "order never reached {:?}, currently {:?}",
        expected,
        order_state(h, hash).await
    );
}

async fn wait_for_actions(
    client: &MockChainClient,
    count: usize,
    pred: impl Fn(&ChainAction) -> bool,
) {
    for _ in 0..300 {
        if client.count_actions(&pred) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} matching actions, saw {:?}",
        count,
        client.submitted_actions()
    );
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn happy_path_native_to_native() {
    let h = harness().await;
    let fx = fixture(1);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();

    // Maker locks on the source chain
    h.resolver.on_event(fx.order_created(1)).await;
    wait_for_state(&h, &fx.order_hash, OrderState::SourceLocked).await;

    // The order is relayed to the target bridge
    wait_for_actions(&h.chain_b, 1, |a| {
        matches!(a, ChainAction::ProcessIncomingOrder { order_hash, .. } if *order_hash == fx.order_hash)
    })
    .await;

    // Both HTLCs observed
    h.resolver.on_event(fx.htlc_created_a(2, relayer_a)).await;
    h.resolver.on_event(fx.htlc_created_b(3)).await;
    wait_for_state(&h, &fx.order_hash, OrderState::TargetLocked).await;

    // Receiver claims on the target, revealing the secret; the
    // resolver claims the source side with it
    h.resolver.on_event(fx.htlc_claimed(CHAIN_B, 4, fx.secret)).await;
    wait_for_actions(&h.chain_a, 1, |a| {
        matches!(a, ChainAction::ClaimHtlc { htlc_id, secret }
            if *htlc_id == fx.htlc_a && *secret == fx.secret)
    })
    .await;

    {
        let slot = h.resolver.store().get(&fx.order_hash).unwrap();
        let order = slot.lock().await;
        assert_eq!(order.secret, Some(fx.secret));
        assert!(order.target_claimed);
        assert!(!order.source_claimed);
    }

    // Our source-side claim lands
    h.resolver.on_event(fx.htlc_claimed(CHAIN_A, 5, fx.secret)).await;
    wait_for_state(&h, &fx.order_hash, OrderState::Fulfilled).await;

    // The principal never moved through the resolver: no refunds, no
    // extra submissions beyond relay + claim
    assert_eq!(
        h.chain_a
            .count_actions(|a| matches!(a, ChainAction::RefundOrder { .. })),
        0
    );
    assert_eq!(h.state.audit_len(), 1);
}

#[tokio::test]
async fn target_side_timeout_refunds_source() {
    let h = harness().await;
    let fx = fixture(2);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();

    h.resolver.on_event(fx.order_created(10)).await;
    h.resolver.on_event(fx.htlc_created_a(11, relayer_a)).await;
    h.resolver.on_event(fx.htlc_created_b(12)).await;
    wait_for_state(&h, &fx.order_hash, OrderState::TargetLocked).await;

    // Receiver never claims; fulfiller refunds the target side
    h.resolver.on_event(fx.htlc_refunded(CHAIN_B, 13)).await;
    assert_eq!(
        order_state(&h, &fx.order_hash).await,
        Some(OrderState::TargetLocked)
    );

    // Source timelock elapses; the sweep refunds the maker
    h.resolver.timeout_sweep(fx.timelock_src + 1).await;
    wait_for_actions(&h.chain_a, 1, |a| {
        matches!(a, ChainAction::RefundOrder { order_hash } if *order_hash == fx.order_hash)
    })
    .await;
    wait_for_state(&h, &fx.order_hash, OrderState::Refunded).await;

    // A later sweep does not refund twice
    h.resolver.timeout_sweep(fx.timelock_src + 100).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.chain_a
            .count_actions(|a| matches!(a, ChainAction::RefundOrder { .. })),
        1
    );
}

#[tokio::test]
async fn wrong_secret_changes_nothing() {
    let h = harness().await;
    let fx = fixture(3);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();

    h.resolver.on_event(fx.order_created(20)).await;
    h.resolver.on_event(fx.htlc_created_a(21, relayer_a)).await;
    h.resolver.on_event(fx.htlc_created_b(22)).await;
    wait_for_state(&h, &fx.order_hash, OrderState::TargetLocked).await;

    // An event carrying a secret that does not open the hashlock is
    // hostile data and must be ignored
    let bad_secret = generate_secret();
    assert_ne!(hashlock_of(&bad_secret), fx.hashlock);
    h.resolver
        .on_event(fx.htlc_claimed(CHAIN_B, 23, bad_secret))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let slot = h.resolver.store().get(&fx.order_hash).unwrap();
    let order = slot.lock().await;
    assert_eq!(order.state, OrderState::TargetLocked);
    assert_eq!(order.secret, None);
    assert!(!order.target_claimed);
    assert_eq!(
        h.chain_a
            .count_actions(|a| matches!(a, ChainAction::ClaimHtlc { .. })),
        0
    );
}

#[tokio::test]
async fn replayed_claim_does_not_double_submit() {
    let h = harness().await;
    let fx = fixture(4);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();

    h.resolver.on_event(fx.order_created(30)).await;
    h.resolver.on_event(fx.htlc_created_a(31, relayer_a)).await;
    h.resolver.on_event(fx.htlc_created_b(32)).await;
    wait_for_state(&h, &fx.order_hash, OrderState::TargetLocked).await;

    // The same claim event is delivered twice (crash before cursor
    // commit); the second delivery is a no-op
    h.resolver.on_event(fx.htlc_claimed(CHAIN_B, 33, fx.secret)).await;
    h.resolver.on_event(fx.htlc_claimed(CHAIN_B, 33, fx.secret)).await;

    wait_for_actions(&h.chain_a, 1, |a| {
        matches!(a, ChainAction::ClaimHtlc { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.chain_a
            .count_actions(|a| matches!(a, ChainAction::ClaimHtlc { .. })),
        1
    );
}

#[tokio::test]
async fn timelock_skew_violation_fails_order() {
    let h = harness().await;
    let fx = fixture(5);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();

    h.resolver.on_event(fx.order_created(40)).await;
    h.resolver.on_event(fx.htlc_created_a(41, relayer_a)).await;

    // Target HTLC expiring after the source lock makes the refund race
    // winnable by the maker; the order must fail
    let mut bad = fx.htlc_created_b(42);
    if let EventPayload::HtlcCreated { timelock, .. } = &mut bad.payload {
        *timelock = fx.timelock_src;
    }
    h.resolver.on_event(bad).await;

    wait_for_state(&h, &fx.order_hash, OrderState::Failed).await;

    // Failed orders still get the mandatory refund once the source
    // timelock elapses
    h.resolver.timeout_sweep(fx.timelock_src + 1).await;
    wait_for_actions(&h.chain_a, 1, |a| {
        matches!(a, ChainAction::RefundOrder { order_hash } if *order_hash == fx.order_hash)
    })
    .await;
}

#[tokio::test]
async fn second_htlc_on_same_chain_is_ignored() {
    let h = harness().await;
    let fx = fixture(6);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();

    h.resolver.on_event(fx.order_created(50)).await;
    h.resolver.on_event(fx.htlc_created_a(51, relayer_a)).await;

    // A second source-side HTLC for the same order must not be
    // accepted, even with different terms
    let mut second = fx.htlc_created_a(52, relayer_a);
    if let EventPayload::HtlcCreated { htlc_id, amount, .. } = &mut second.payload {
        *htlc_id = [0xee; 32];
        *amount = U256::from(1);
    }
    h.resolver.on_event(second).await;

    let slot = h.resolver.store().get(&fx.order_hash).unwrap();
    let order = slot.lock().await;
    assert_eq!(order.source_htlc.as_ref().unwrap().htlc_id, fx.htlc_a);
    assert_eq!(order.state, OrderState::SourceLocked);
}

#[tokio::test]
async fn reconciliation_reverts_forked_out_target_lock() {
    let h = harness().await;
    let fx = fixture(7);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();

    h.resolver.on_event(fx.order_created(60)).await;
    h.resolver.on_event(fx.htlc_created_a(61, relayer_a)).await;
    h.resolver.on_event(fx.htlc_created_b(62)).await;
    wait_for_state(&h, &fx.order_hash, OrderState::TargetLocked).await;

    // The source is funded, but the target chain has no trace of the
    // HTLC the ingestor saw: the lock was forked out
    h.chain_a.set_order_view(
        fx.order_hash,
        OrderView {
            funded: true,
            fulfilled: false,
            refunded: false,
            secret: None,
        },
    );
    h.chain_a.set_htlc_view(
        fx.htlc_a,
        HtlcView {
            phase: HtlcPhase::Locked,
            amount: fx.amount_in,
            hashlock: fx.hashlock,
            timelock: fx.timelock_src,
            secret: None,
        },
    );

    h.resolver.reconcile().await;
    wait_for_state(&h, &fx.order_hash, OrderState::SourceLocked).await;

    {
        let slot = h.resolver.store().get(&fx.order_hash).unwrap();
        let order = slot.lock().await;
        assert!(order.target_htlc.is_none());
        assert_eq!(order.target_timelock, None);
    }

    // The chain re-emits the creation in a later block; the order
    // advances again
    let mut recreated = fx.htlc_created_b(63);
    recreated.block_number = 510;
    h.resolver.on_event(recreated).await;
    wait_for_state(&h, &fx.order_hash, OrderState::TargetLocked).await;
}

#[tokio::test]
async fn reconciliation_retries_target_claim_with_observed_secret() {
    let h = harness().await;
    let fx = fixture(8);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();
    let relayer_b = h.chains.get(CHAIN_B).unwrap().relayer_address();

    h.resolver.on_event(fx.order_created(70)).await;
    h.resolver.on_event(fx.htlc_created_a(71, relayer_a)).await;

    // The target HTLC names the relayer as receiver (matched counter
    // order), so the claim role is ours
    let mut created_b = fx.htlc_created_b(72);
    if let EventPayload::HtlcCreated { receiver, .. } = &mut created_b.payload {
        *receiver = relayer_b;
    }
    h.resolver.on_event(created_b).await;
    wait_for_state(&h, &fx.order_hash, OrderState::TargetLocked).await;

    // On-chain the source was already claimed with a visible secret,
    // but the claim event never reached us
    h.chain_a.set_htlc_view(
        fx.htlc_a,
        HtlcView {
            phase: HtlcPhase::Claimed,
            amount: fx.amount_in,
            hashlock: fx.hashlock,
            timelock: fx.timelock_src,
            secret: Some(fx.secret),
        },
    );
    h.chain_b.set_htlc_view(
        fx.htlc_b,
        HtlcView {
            phase: HtlcPhase::Locked,
            amount: fx.amount_out,
            hashlock: fx.hashlock,
            timelock: fx.timelock_tgt,
            secret: None,
        },
    );

    h.resolver.reconcile().await;
    wait_for_actions(&h.chain_b, 1, |a| {
        matches!(a, ChainAction::ClaimHtlc { htlc_id, secret }
            if *htlc_id == fx.htlc_b && *secret == fx.secret)
    })
    .await;
}

#[tokio::test]
async fn critical_breach_halts_order() {
    let h = harness().await;
    let fx = fixture(9);
    let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();
    let relayer_b = h.chains.get(CHAIN_B).unwrap().relayer_address();

    h.resolver.on_event(fx.order_created(80)).await;
    h.resolver.on_event(fx.htlc_created_a(81, relayer_a)).await;
    let mut created_b = fx.htlc_created_b(82);
    if let EventPayload::HtlcCreated { receiver, .. } = &mut created_b.payload {
        *receiver = relayer_b;
    }
    h.resolver.on_event(created_b).await;
    wait_for_state(&h, &fx.order_hash, OrderState::TargetLocked).await;

    // Source refunded while the target HTLC we would claim is live:
    // the timelock invariant failed somewhere, stop touching the order
    h.chain_a.set_htlc_view(
        fx.htlc_a,
        HtlcView {
            phase: HtlcPhase::Refunded,
            amount: fx.amount_in,
            hashlock: fx.hashlock,
            timelock: fx.timelock_src,
            secret: None,
        },
    );
    h.chain_b.set_htlc_view(
        fx.htlc_b,
        HtlcView {
            phase: HtlcPhase::Locked,
            amount: fx.amount_out,
            hashlock: fx.hashlock,
            timelock: fx.timelock_tgt,
            secret: None,
        },
    );

    h.resolver.reconcile().await;

    let slot = h.resolver.store().get(&fx.order_hash).unwrap();
    {
        let order = slot.lock().await;
        assert!(order.halted);
        assert!(order.needs_attention);
    }

    // Halted orders are excluded from automatic refunds
    h.resolver.timeout_sweep(fx.timelock_src + 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.chain_a
            .count_actions(|a| matches!(a, ChainAction::RefundOrder { .. })),
        0
    );
}

#[tokio::test]
async fn manual_fulfill_verifies_secret_and_targets_bridge() {
    let h = harness().await;
    let fx = fixture(10);

    h.resolver.on_event(fx.order_created(90)).await;
    wait_for_state(&h, &fx.order_hash, OrderState::SourceLocked).await;

    let bad = generate_secret();
    let err = h.resolver.submit_fulfill(fx.order_hash, bad).await;
    assert!(err.is_err());

    h.resolver
        .submit_fulfill(fx.order_hash, fx.secret)
        .await
        .unwrap();
    wait_for_actions(&h.chain_b, 1, |a| {
        matches!(a, ChainAction::FulfillIncomingOrder { order_hash, secret }
            if *order_hash == fx.order_hash && *secret == fx.secret)
    })
    .await;
}

// ----------------------------------------------------------------------
// Ingestor: finality window and cursor
// ----------------------------------------------------------------------

#[tokio::test]
async fn ingestor_stays_behind_confirmation_depth() {
    let h = harness().await;
    let fx_confirmed = fixture(11);
    let fx_at_tip = fixture(12);

    // One order at a confirmed depth, one at the tip
    h.chain_a.set_tip(915);
    let mut deep = fx_confirmed.order_created(100);
    deep.block_number = 910;
    let mut shallow = fx_at_tip.order_created(101);
    shallow.block_number = 915;
    h.chain_a.push_event(deep);
    h.chain_a.push_event(shallow);

    let shutdown = Arc::new(RwLock::new(false));
    let state_dyn: Arc<dyn StateStore> = h.state.clone();
    let ingestor = EventIngestor::new(
        h.chains.get(CHAIN_A).unwrap(),
        h.resolver.clone(),
        state_dyn,
        Duration::from_millis(20),
        shutdown.clone(),
    );
    let handle = tokio::spawn(async move { ingestor.run().await });

    wait_for_state(&h, &fx_confirmed.order_hash, OrderState::SourceLocked).await;

    // The event at the tip is invisible below the confirmation depth
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(order_state(&h, &fx_at_tip.order_hash).await.is_none());
    assert_eq!(h.state.get_cursor(CHAIN_A).await.unwrap(), Some(912));

    // Once the chain advances, the shallow event confirms and arrives
    h.chain_a.set_tip(920);
    wait_for_state(&h, &fx_at_tip.order_hash, OrderState::SourceLocked).await;
    assert_eq!(h.state.get_cursor(CHAIN_A).await.unwrap(), Some(917));

    *shutdown.write().await = true;
    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
}

// ----------------------------------------------------------------------
// Randomized cross-chain interleavings
// ----------------------------------------------------------------------

/// Merge two per-chain sequences preserving within-chain order, then
/// inject immediate duplicates.
fn interleave(
    rng: &mut StdRng,
    mut a: Vec<ChainEvent>,
    mut b: Vec<ChainEvent>,
) -> Vec<ChainEvent> {
    a.reverse();
    b.reverse();
    let mut merged = Vec::new();
    while !a.is_empty() || !b.is_empty() {
        let take_a = match (a.is_empty(), b.is_empty()) {
            (false, false) => rng.gen_bool(0.5),
            (false, true) => true,
            (true, false) => false,
            (true, true) => break,
        };
        let event = if take_a {
            a.pop().unwrap()
        } else {
            b.pop().unwrap()
        };
        merged.push(event.clone());
        if rng.gen_bool(0.3) {
            merged.push(event);
        }
    }
    merged
}

#[tokio::test]
async fn random_interleavings_converge_to_fulfilled() {
    for seed in 0..20u64 {
        let h = harness().await;
        let fx = fixture(20);
        let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();
        let mut rng = StdRng::seed_from_u64(seed);

        let chain_a_events = vec![
            fx.order_created(200),
            fx.htlc_created_a(201, relayer_a),
            fx.htlc_claimed(CHAIN_A, 202, fx.secret),
        ];
        let chain_b_events = vec![
            fx.htlc_created_b(203),
            fx.htlc_claimed(CHAIN_B, 204, fx.secret),
        ];

        for event in interleave(&mut rng, chain_a_events, chain_b_events) {
            h.resolver.on_event(event).await;
        }

        wait_for_state(&h, &fx.order_hash, OrderState::Fulfilled).await;
        let slot = h.resolver.store().get(&fx.order_hash).unwrap();
        let order = slot.lock().await;
        assert_eq!(order.secret, Some(fx.secret), "seed {}", seed);
        assert!(order.source_claimed && order.target_claimed, "seed {}", seed);
    }
}

#[tokio::test]
async fn random_interleavings_without_claims_refund() {
    for seed in 0..10u64 {
        let h = harness().await;
        let fx = fixture(21);
        let relayer_a = h.chains.get(CHAIN_A).unwrap().relayer_address();
        let mut rng = StdRng::seed_from_u64(seed);

        let chain_a_events = vec![fx.order_created(300), fx.htlc_created_a(301, relayer_a)];
        let chain_b_events = vec![fx.htlc_created_b(302), fx.htlc_refunded(CHAIN_B, 303)];

        for event in interleave(&mut rng, chain_a_events, chain_b_events) {
            h.resolver.on_event(event).await;
        }

        h.resolver.timeout_sweep(fx.timelock_src + 1).await;
        wait_for_state(&h, &fx.order_hash, OrderState::Refunded).await;

        let slot = h.resolver.store().get(&fx.order_hash).unwrap();
        let order = slot.lock().await;
        assert!(!order.source_claimed, "seed {}", seed);
        assert!(order.state.is_terminal(), "seed {}", seed);
    }
}
