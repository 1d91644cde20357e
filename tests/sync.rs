use bitnun_sim::clock::ManualClock;
use bitnun_sim::config::SimConfig;
use bitnun_sim::events::{EventKind, NodeEvent};
use bitnun_sim::random::PinnedRandom;
use async_trait::async_trait;
use bitnun_sim::store::{
    row, tables, ChangeCallback, ChangeKind, DataStore, Filter, MemoryStore, Row, StoreError, SubscriptionHandle,
};
use bitnun_sim::sync::SyncError;
use bitnun_sim::types::Address;
use bitnun_sim::Session;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn session(store: Arc<dyn DataStore>) -> Session {
    let mut cfg = SimConfig::default();
    cfg.node.address = Some("node_sync".into());
    cfg.mining.difficulty = 1;
    cfg.mining.idle_poll_ms = 10;
    cfg.sync.interval_ms = 1_000;
    Session::with_sources(
        cfg,
        store,
        Arc::new(ManualClock::at_hour(20)),
        Arc::new(PinnedRandom::zero()),
    )
    .unwrap()
}

fn collect(session: &Session, kind: EventKind) -> Arc<Mutex<Vec<NodeEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session.events().on(kind, move |e| sink.lock().push(e.clone()));
    seen
}

#[tokio::test]
async fn upserts_node_row_and_persists_blocks_once() {
    let store = Arc::new(MemoryStore::new());
    let s = session(store.clone());
    let node = s.node();

    s.sync().sync_once().await.unwrap();
    s.sync().sync_once().await.unwrap();
    let nodes = store.rows(tables::NODES);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["node_id"], "node_sync");
    assert_eq!(store.row_count(tables::BALANCES), 1);

    node.create_transaction(Address::from("bob"), 1.0, bitnun_sim::ledger::TxKind::Transfer)
        .unwrap();
    node.start_mining().unwrap();
    for _ in 0..500 {
        if node.pending_transactions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    node.stop_mining();
    let mined = (node.chain_length() - 1) as u64;
    assert!(mined >= 1);

    let report = s.sync().sync_once().await.unwrap();
    assert_eq!(report.blocks as u64, mined);
    assert_eq!(report.rewards as u64, mined);
    assert_eq!(store.row_count(tables::TRANSACTIONS), 1);
    assert_eq!(store.row_count(tables::MINING_REWARDS) as u64, mined);
    assert_eq!(s.sync().cursor(), mined + 1);

    let again = s.sync().sync_once().await.unwrap();
    assert_eq!(again.blocks, 0);
    assert_eq!(store.row_count(tables::MINING_REWARDS) as u64, mined);
}

/// Fails the first transaction upsert it sees, then behaves like the inner store.
struct FailFirstTransaction {
    inner: Arc<MemoryStore>,
    tripped: AtomicBool,
}

#[async_trait]
impl DataStore for FailFirstTransaction {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        self.inner.select(table, filter).await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<(), StoreError> {
        self.inner.insert(table, row).await
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError> {
        self.inner.update(table, filter, patch).await
    }

    async fn upsert(&self, table: &str, row: Row, conflict_key: &str) -> Result<(), StoreError> {
        if table == tables::TRANSACTIONS && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.upsert(table, row, conflict_key).await
    }

    fn subscribe(&self, table: &str, kinds: &[ChangeKind], callback: ChangeCallback) -> SubscriptionHandle {
        self.inner.subscribe(table, kinds, callback)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.unsubscribe(handle)
    }

    fn unsubscribe_all(&self) {
        self.inner.unsubscribe_all()
    }
}

#[tokio::test]
async fn retry_after_partial_block_failure_writes_each_row_once() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(FailFirstTransaction {
        inner: memory.clone(),
        tripped: AtomicBool::new(false),
    });
    let s = session(store);
    let node = s.node();
    node.create_transaction(Address::from("bob"), 1.0, bitnun_sim::ledger::TxKind::Transfer)
        .unwrap();
    node.start_mining().unwrap();
    for _ in 0..500 {
        if node.pending_transactions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    node.stop_mining();
    let mined = node.chain_length() - 1;
    assert_eq!(mined, 1);

    assert!(s.sync().sync_once().await.is_err());
    assert_eq!(s.sync().cursor(), 1);
    let report = s.sync().sync_once().await.unwrap();
    assert_eq!(report.blocks, 1);
    assert_eq!(memory.row_count(tables::MINING_REWARDS), 1);
    assert_eq!(memory.row_count(tables::TRANSACTIONS), 1);
    assert_eq!(s.sync().cursor(), 2);
}

#[tokio::test]
async fn offline_store_reports_sync_error() {
    let store = Arc::new(MemoryStore::new());
    store.set_available(false);
    let s = session(store.clone());
    let errors = collect(&s, EventKind::SyncError);

    let err = s.sync().sync_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Store(_)));
    assert_eq!(errors.lock().len(), 1);
    assert_eq!(s.telemetry().counter("sync.failed"), 1);

    store.set_available(true);
    s.sync().sync_once().await.unwrap();
    assert_eq!(errors.lock().len(), 1);
    assert_eq!(s.telemetry().counter("sync.success"), 1);
}

#[tokio::test]
async fn relays_foreign_rows_and_skips_own_echoes() {
    let store = Arc::new(MemoryStore::new());
    let s = session(store.clone());
    let statuses = collect(&s, EventKind::NodeStatus);
    let balances = collect(&s, EventKind::BalanceUpdate);
    s.sync().attach_subscriptions();

    s.sync().sync_once().await.unwrap();
    assert!(statuses.lock().is_empty());
    assert!(balances.lock().is_empty());

    store
        .upsert(
            tables::NODES,
            row(json!({"node_id": "node_peer", "origin": "node_peer", "mining_active": true, "chain_length": 9, "status": "mining"})),
            "node_id",
        )
        .await
        .unwrap();
    store
        .insert(
            tables::BALANCES,
            row(json!({"address": "node_peer", "balance": 12.5, "origin": "node_peer"})),
        )
        .await
        .unwrap();

    assert_eq!(
        statuses.lock().clone(),
        vec![NodeEvent::NodeStatus {
            address: Address::from("node_peer"),
            mining_active: true,
            chain_length: 9,
            status: "mining".into(),
        }]
    );
    assert_eq!(balances.lock().len(), 1);

    s.sync().detach_subscriptions();
    store
        .insert(tables::BALANCES, row(json!({"address": "x", "balance": 1.0, "origin": "other"})))
        .await
        .unwrap();
    assert_eq!(balances.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn loop_ticks_until_stopped() {
    let store = Arc::new(MemoryStore::new());
    let s = session(store.clone());
    s.sync().start().unwrap();
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let ticks = s.telemetry().counter("sync.success");
    assert_eq!(ticks, 4);

    s.sync().stop();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(s.telemetry().counter("sync.success"), ticks);
    assert!(!s.sync().is_running());
}
