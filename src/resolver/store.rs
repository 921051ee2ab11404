//! Order store: the single owner of orders, secrets and the dedup set
//!
//! All mutation of an order goes through its per-order mutex, which is
//! the single-writer-per-order guarantee. Events, the timeout sweep
//! and reconciliation all serialize on it; across orders, work runs in
//! parallel.

use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, EventKey};
use crate::resolver::order::{ChainId, CrossChainOrder, Hashlock, HtlcId, OrderHash, OrderState, Secret};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Snapshot of order counts for stats and metrics
#[derive(Debug, Clone, Default)]
pub struct OrderStats {
    pub total: usize,
    pub by_state: HashMap<&'static str, usize>,
    pub secrets_held: usize,
    pub needs_attention: usize,
}

pub struct OrderStore {
    orders: DashMap<OrderHash, Arc<Mutex<CrossChainOrder>>>,
    by_hashlock: DashMap<Hashlock, OrderHash>,
    by_htlc: DashMap<(ChainId, HtlcId), OrderHash>,
    secrets: DashMap<OrderHash, Secret>,
    /// Processed-event keys; mirrors the persisted dedup set
    seen_events: DashMap<EventKey, ()>,
    /// Terminal orders with the time they became terminal, for
    /// eviction and garbage collection
    terminal: DashMap<OrderHash, DateTime<Utc>>,
    /// HTLC events observed before their order, keyed by hashlock.
    /// No cross-chain ordering is promised, so the target side can
    /// legitimately show up first.
    orphans: DashMap<Hashlock, Vec<ChainEvent>>,
    orphan_htlcs: DashMap<(ChainId, HtlcId), Hashlock>,
    max_pending: usize,
}

/// Total orphaned events retained across all hashlocks
const MAX_ORPHAN_EVENTS: usize = 4096;

impl OrderStore {
    pub fn new(max_pending: usize) -> Self {
        Self {
            orders: DashMap::new(),
            by_hashlock: DashMap::new(),
            by_htlc: DashMap::new(),
            secrets: DashMap::new(),
            seen_events: DashMap::new(),
            terminal: DashMap::new(),
            orphans: DashMap::new(),
            orphan_htlcs: DashMap::new(),
            max_pending,
        }
    }

    /// Insert a new order. At capacity, the oldest terminal orders are
    /// evicted first; if none exist the insert is rejected.
    pub fn insert(&self, order: CrossChainOrder) -> RelayerResult<()> {
        if self.orders.contains_key(&order.order_hash) {
            debug!(
                order_hash = %hex::encode(order.order_hash),
                "Order already tracked, ignoring duplicate insert"
            );
            return Ok(());
        }

        if self.orders.len() >= self.max_pending && !self.evict_oldest_terminal() {
            warn!(
                pending = self.orders.len(),
                "Order table full with no terminal candidates, rejecting insert"
            );
            crate::metrics::record_backpressure(order.source_chain);
            return Err(RelayerError::Capacity {
                pending: self.orders.len(),
            });
        }

        self.by_hashlock.insert(order.hashlock, order.order_hash);
        let hash = order.order_hash;
        self.orders.insert(hash, Arc::new(Mutex::new(order)));
        Ok(())
    }

    fn evict_oldest_terminal(&self) -> bool {
        let oldest = self
            .terminal
            .iter()
            .min_by_key(|e| *e.value())
            .map(|e| *e.key());
        match oldest {
            Some(hash) => {
                debug!(order_hash = %hex::encode(hash), "Evicting terminal order at capacity");
                self.remove(&hash);
                true
            }
            None => false,
        }
    }

    /// Handle to an order's serializer, if tracked
    pub fn get(&self, order_hash: &OrderHash) -> Option<Arc<Mutex<CrossChainOrder>>> {
        self.orders.get(order_hash).map(|e| e.clone())
    }

    pub fn contains(&self, order_hash: &OrderHash) -> bool {
        self.orders.contains_key(order_hash)
    }

    pub fn find_by_hashlock(&self, hashlock: &Hashlock) -> Option<Arc<Mutex<CrossChainOrder>>> {
        self.by_hashlock
            .get(hashlock)
            .and_then(|e| self.get(e.value()))
    }

    pub fn find_by_htlc(
        &self,
        chain_id: ChainId,
        htlc_id: &HtlcId,
    ) -> Option<Arc<Mutex<CrossChainOrder>>> {
        self.by_htlc
            .get(&(chain_id, *htlc_id))
            .and_then(|e| self.get(e.value()))
    }

    /// Register an observed HTLC against its order
    pub fn register_htlc(&self, chain_id: ChainId, htlc_id: HtlcId, order_hash: OrderHash) {
        self.by_htlc.insert((chain_id, htlc_id), order_hash);
    }

    /// Drop an HTLC index entry (reconciliation revert of a forked-out
    /// lock)
    pub fn unregister_htlc(&self, chain_id: ChainId, htlc_id: &HtlcId) {
        self.by_htlc.remove(&(chain_id, *htlc_id));
    }

    /// Buffer an HTLC event whose order is not yet known. Returns false
    /// when the buffer is full and the event was dropped.
    pub fn buffer_orphan(
        &self,
        hashlock: Hashlock,
        chain_id: ChainId,
        htlc_id: HtlcId,
        event: ChainEvent,
    ) -> bool {
        let total: usize = self.orphans.iter().map(|e| e.value().len()).sum();
        if total >= MAX_ORPHAN_EVENTS {
            warn!(
                hashlock = %hex::encode(hashlock),
                "Orphan event buffer full, dropping event"
            );
            return false;
        }
        self.orphan_htlcs.insert((chain_id, htlc_id), hashlock);
        self.orphans.entry(hashlock).or_default().push(event);
        true
    }

    /// Hashlock a previously-orphaned HTLC belongs to, if any
    pub fn orphan_hashlock_for(&self, chain_id: ChainId, htlc_id: &HtlcId) -> Option<Hashlock> {
        self.orphan_htlcs
            .get(&(chain_id, *htlc_id))
            .map(|e| *e.value())
    }

    /// Take all events buffered under a hashlock, in arrival order
    pub fn drain_orphans(&self, hashlock: &Hashlock) -> Vec<ChainEvent> {
        let events = self
            .orphans
            .remove(hashlock)
            .map(|(_, v)| v)
            .unwrap_or_default();
        self.orphan_htlcs.retain(|_, v| v != hashlock);
        events
    }

    /// Record an event key. Returns false if it was already seen
    /// (idempotent redelivery).
    pub fn mark_seen(&self, key: EventKey) -> bool {
        self.seen_events.insert(key, ()).is_none()
    }

    /// Preload the dedup set from the persisted store at startup
    pub fn load_seen(&self, keys: impl IntoIterator<Item = EventKey>) {
        for key in keys {
            self.seen_events.insert(key, ());
        }
    }

    pub fn put_secret(&self, order_hash: OrderHash, secret: Secret) {
        self.secrets.insert(order_hash, secret);
    }

    pub fn secret(&self, order_hash: &OrderHash) -> Option<Secret> {
        self.secrets.get(order_hash).map(|e| *e.value())
    }

    /// Note that an order reached a terminal state
    pub fn mark_terminal(&self, order_hash: OrderHash, at: DateTime<Utc>) {
        self.terminal.insert(order_hash, at);
    }

    /// Remove an order, its secret and its index entries
    pub fn remove(&self, order_hash: &OrderHash) {
        if let Some((_, slot)) = self.orders.remove(order_hash) {
            // The slot may still be locked by an in-flight handler;
            // indexes go first so no new handler can find it.
            if let Ok(order) = slot.try_lock() {
                self.by_hashlock.remove(&order.hashlock);
                if let Some(htlc) = &order.source_htlc {
                    self.by_htlc.remove(&(order.source_chain, htlc.htlc_id));
                }
                if let Some(htlc) = &order.target_htlc {
                    self.by_htlc.remove(&(order.target_chain, htlc.htlc_id));
                }
            }
        }
        self.secrets.remove(order_hash);
        self.terminal.remove(order_hash);
    }

    /// Drop terminal orders older than the retention horizon. Secrets
    /// are cleared with the order. Returns the removed hashes.
    pub fn gc_expired(&self, retention: Duration, now: DateTime<Utc>) -> Vec<OrderHash> {
        let expired: Vec<OrderHash> = self
            .terminal
            .iter()
            .filter(|e| now - *e.value() > retention)
            .map(|e| *e.key())
            .collect();

        for hash in &expired {
            debug!(order_hash = %hex::encode(hash), "Garbage collecting terminal order");
            self.remove(hash);
        }
        expired
    }

    /// Hashes of every tracked order
    pub fn all_hashes(&self) -> Vec<OrderHash> {
        self.orders.iter().map(|e| *e.key()).collect()
    }

    /// Hashes of all non-terminal orders (sweep and reconciliation)
    pub fn non_terminal_hashes(&self) -> Vec<OrderHash> {
        let mut hashes: Vec<OrderHash> =
            self.orders.iter().map(|e| *e.key()).collect();
        hashes.retain(|h| !self.terminal.contains_key(h));
        hashes
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Counting snapshot; locks each order briefly
    pub async fn stats(&self) -> OrderStats {
        let mut stats = OrderStats {
            total: self.orders.len(),
            secrets_held: self.secrets.len(),
            ..Default::default()
        };
        let slots: Vec<Arc<Mutex<CrossChainOrder>>> =
            self.orders.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let order = slot.lock().await;
            *stats.by_state.entry(order.state.as_str()).or_insert(0) += 1;
            if order.needs_attention {
                stats.needs_attention += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::order::native_token;
    use ethers::types::{Address, H256, U256};

    fn order(n: u8, state: OrderState) -> CrossChainOrder {
        let mut o = CrossChainOrder::new(
            [n; 32],
            1,
            2,
            native_token(),
            native_token(),
            U256::from(100),
            U256::from(99),
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x22),
            [n.wrapping_add(100); 32],
            2_000_000_000,
            Utc::now(),
        );
        o.state = state;
        o
    }

    #[test]
    fn insert_and_lookup_by_hashlock() {
        let store = OrderStore::new(10);
        let o = order(1, OrderState::Pending);
        let hashlock = o.hashlock;
        store.insert(o).unwrap();

        assert!(store.contains(&[1; 32]));
        assert!(store.find_by_hashlock(&hashlock).is_some());
        assert!(store.find_by_hashlock(&[0xff; 32]).is_none());
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let store = OrderStore::new(10);
        store.insert(order(1, OrderState::Pending)).unwrap();
        store.insert(order(1, OrderState::Pending)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn capacity_rejects_without_terminal_candidates() {
        let store = OrderStore::new(2);
        store.insert(order(1, OrderState::Pending)).unwrap();
        store.insert(order(2, OrderState::SourceLocked)).unwrap();

        let err = store.insert(order(3, OrderState::Pending)).unwrap_err();
        assert!(matches!(err, RelayerError::Capacity { pending: 2 }));
    }

    #[test]
    fn capacity_evicts_oldest_terminal_first() {
        let store = OrderStore::new(2);
        store.insert(order(1, OrderState::Refunded)).unwrap();
        store.insert(order(2, OrderState::Fulfilled)).unwrap();
        let t0 = Utc::now();
        store.mark_terminal([1; 32], t0 - Duration::hours(2));
        store.mark_terminal([2; 32], t0 - Duration::hours(1));

        store.insert(order(3, OrderState::Pending)).unwrap();
        assert!(!store.contains(&[1; 32]));
        assert!(store.contains(&[2; 32]));
        assert!(store.contains(&[3; 32]));
    }

    #[test]
    fn event_dedup() {
        let store = OrderStore::new(10);
        let key = EventKey {
            chain_id: 1,
            tx_hash: H256::repeat_byte(0x01),
            log_index: 0,
        };
        assert!(store.mark_seen(key));
        assert!(!store.mark_seen(key));
    }

    #[test]
    fn dedup_preload() {
        let store = OrderStore::new(10);
        let key = EventKey {
            chain_id: 1,
            tx_hash: H256::repeat_byte(0x02),
            log_index: 3,
        };
        store.load_seen([key]);
        assert!(!store.mark_seen(key));
    }

    #[test]
    fn gc_clears_secrets_with_orders() {
        let store = OrderStore::new(10);
        store.insert(order(1, OrderState::Fulfilled)).unwrap();
        store.put_secret([1; 32], [0x55; 32]);
        let now = Utc::now();
        store.mark_terminal([1; 32], now - Duration::hours(25));

        let removed = store.gc_expired(Duration::hours(24), now);
        assert_eq!(removed, vec![[1u8; 32]]);
        assert!(!store.contains(&[1; 32]));
        assert!(store.secret(&[1; 32]).is_none());
    }

    #[test]
    fn gc_retains_recent_terminal_orders() {
        let store = OrderStore::new(10);
        store.insert(order(1, OrderState::Fulfilled)).unwrap();
        let now = Utc::now();
        store.mark_terminal([1; 32], now - Duration::hours(1));

        let removed = store.gc_expired(Duration::hours(24), now);
        assert!(removed.is_empty());
        assert!(store.contains(&[1; 32]));
    }

    #[test]
    fn htlc_index() {
        let store = OrderStore::new(10);
        store.insert(order(1, OrderState::SourceLocked)).unwrap();
        store.register_htlc(1, [0xaa; 32], [1; 32]);

        assert!(store.find_by_htlc(1, &[0xaa; 32]).is_some());
        assert!(store.find_by_htlc(2, &[0xaa; 32]).is_none());
    }

    #[test]
    fn orphan_buffer_round_trip() {
        use crate::events::{ChainEvent, EventPayload};

        let store = OrderStore::new(10);
        let hashlock = [0x77; 32];
        let event = ChainEvent {
            chain_id: 2,
            block_number: 50,
            tx_hash: H256::repeat_byte(0x05),
            log_index: 0,
            payload: EventPayload::HtlcRefunded { htlc_id: [0x99; 32] },
        };

        assert!(store.buffer_orphan(hashlock, 2, [0x99; 32], event.clone()));
        assert_eq!(store.orphan_hashlock_for(2, &[0x99; 32]), Some(hashlock));
        assert_eq!(store.orphan_hashlock_for(1, &[0x99; 32]), None);

        let drained = store.drain_orphans(&hashlock);
        assert_eq!(drained.len(), 1);
        assert_eq!(store.orphan_hashlock_for(2, &[0x99; 32]), None);
        assert!(store.drain_orphans(&hashlock).is_empty());
    }

    #[test]
    fn non_terminal_listing_skips_terminal() {
        let store = OrderStore::new(10);
        store.insert(order(1, OrderState::SourceLocked)).unwrap();
        store.insert(order(2, OrderState::Refunded)).unwrap();
        store.mark_terminal([2; 32], Utc::now());

        let hashes = store.non_terminal_hashes();
        assert_eq!(hashes, vec![[1u8; 32]]);
    }
}
