//! Real-time sync between a node and the external store.
//!
//! On every tick the loop upserts the node's stats row, its balance row, and
//! upserts transactions and mining rewards from blocks it has not written
//! yet, so a block retried after a partial failure is not duplicated. Each store call is bounded by `timeout_ms`; a failure is logged,
//! reported as a `sync_error` event and retried by the next tick only.
//!
//! In the other direction, store change notifications on the node-facing
//! tables are re-emitted as node events. Rows carry `origin`, and rows this
//! session wrote itself are not relayed back.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncSection;
use crate::events::{EventBus, NodeEvent};
use crate::ledger::Block;
use crate::node::{Node, COINBASE};
use crate::store::{row, tables, ChangeEvent, ChangeKind, DataStore, Row, StoreError, SubscriptionHandle};
use crate::types::Address;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },
    #[error("no tokio runtime available to run the sync loop")]
    NoRuntime,
}

/// What one successful pass wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub blocks: usize,
    pub transactions: usize,
    pub rewards: usize,
}

struct SyncInner {
    node: Node,
    store: Arc<dyn DataStore>,
    cfg: SyncSection,
    /// Index of the first block not yet persisted; genesis is never written.
    cursor: Mutex<u64>,
    running: AtomicBool,
    generation: AtomicU64,
    stop_signal: Notify,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

#[derive(Clone)]
pub struct RealtimeSync {
    inner: Arc<SyncInner>,
}

impl RealtimeSync {
    pub fn new(node: Node, store: Arc<dyn DataStore>, cfg: SyncSection) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                node,
                store,
                cfg,
                cursor: Mutex::new(1),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                stop_signal: Notify::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Next block index the loop will persist.
    pub fn cursor(&self) -> u64 {
        *self.inner.cursor.lock()
    }

    /// Spawns the periodic loop; the first pass runs immediately.
    pub fn start(&self) -> Result<(), SyncError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        runtime.spawn(run_loop(Arc::clone(&self.inner), generation));
        info!(interval_ms = self.inner.cfg.interval_ms, "sync loop started");
        Ok(())
    }

    /// Ends the loop after its current pass; idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.stop_signal.notify_waiters();
        info!("sync loop stopped");
    }

    /// One pass; errors are reported through events and telemetry as well as returned.
    pub async fn sync_once(&self) -> Result<SyncReport, SyncError> {
        sync_once(&self.inner).await
    }

    /// Relays store changes on the node-facing tables as node events.
    pub fn attach_subscriptions(&self) {
        let mut handles = self.inner.subscriptions.lock();
        if !handles.is_empty() {
            return;
        }
        let own = self.inner.node.address().clone();
        for table in [tables::TRANSACTIONS, tables::MINING_REWARDS, tables::NODES, tables::BALANCES] {
            let events: Arc<EventBus> = Arc::clone(self.inner.node.events());
            let own = own.clone();
            let handle = self.inner.store.subscribe(
                table,
                &[ChangeKind::Insert, ChangeKind::Update],
                Arc::new(move |change: ChangeEvent| {
                    if change.row.get("origin").and_then(Value::as_str) == Some(own.as_str()) {
                        return;
                    }
                    match event_from_row(&change.table, &change.row) {
                        Some(event) => {
                            events.emit(&event);
                        }
                        None => debug!(table = %change.table, "unrecognised change row ignored"),
                    }
                }),
            );
            handles.push(handle);
        }
        debug!(subscriptions = handles.len(), "store subscriptions attached");
    }

    pub fn detach_subscriptions(&self) {
        let handles: Vec<SubscriptionHandle> = std::mem::take(&mut *self.inner.subscriptions.lock());
        for handle in handles {
            self.inner.store.unsubscribe(handle);
        }
    }
}

async fn run_loop(inner: Arc<SyncInner>, generation: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(inner.cfg.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.stop_signal.notified() => {}
        }
        if inner.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        // already reported inside
        let _ = sync_once(&inner).await;
    }
    debug!(generation, "sync loop exited");
}

async fn bounded<T, F>(cfg: &SyncSection, operation: &'static str, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(Duration::from_millis(cfg.timeout_ms), fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SyncError::Timeout {
            operation,
            timeout_ms: cfg.timeout_ms,
        }),
    }
}

async fn sync_once(inner: &SyncInner) -> Result<SyncReport, SyncError> {
    let started = Instant::now();
    let telemetry = inner.node.telemetry();
    let result = write_pass(inner).await;
    telemetry.record_latency_ms("sync.round_trip_ms", started.elapsed().as_millis() as u64);
    match &result {
        Ok(report) => {
            telemetry.incr("sync.success");
            debug!(
                blocks = report.blocks,
                transactions = report.transactions,
                rewards = report.rewards,
                "sync pass complete"
            );
        }
        Err(e) => {
            telemetry.incr("sync.failed");
            let operation = match e {
                SyncError::Timeout { operation, .. } => *operation,
                _ => "sync",
            };
            warn!(operation, error = %e, "sync pass failed");
            inner.node.events().emit(&NodeEvent::SyncError {
                operation: operation.to_owned(),
                message: e.to_string(),
            });
        }
    }
    result
}

async fn write_pass(inner: &SyncInner) -> Result<SyncReport, SyncError> {
    let node = &inner.node;
    let stats = node.get_network_stats();
    bounded(
        &inner.cfg,
        "upsert_node",
        inner.store.upsert(tables::NODES, stats.to_row(), "node_id"),
    )
    .await?;
    let balance = row(json!({
        "address": stats.address.as_str(),
        "balance": stats.balance,
        "action_rewards": stats.action_rewards,
        "origin": stats.address.as_str(),
        "updated_at": stats.timestamp,
    }));
    bounded(
        &inner.cfg,
        "upsert_balance",
        inner.store.upsert(tables::BALANCES, balance, "address"),
    )
    .await?;

    let mut report = SyncReport::default();
    let start = *inner.cursor.lock();
    for block in node.blocks_since(start) {
        let (txs, rewards) = persist_block(inner, node.address(), &block).await?;
        // advance per block so a failure part-way retries only the remainder
        *inner.cursor.lock() = block.index + 1;
        report.blocks += 1;
        report.transactions += txs;
        report.rewards += rewards;
    }
    Ok(report)
}

async fn persist_block(inner: &SyncInner, origin: &Address, block: &Block) -> Result<(usize, usize), SyncError> {
    let coinbase = Address::from(COINBASE);
    let (mut txs, mut rewards) = (0, 0);
    for tx in &block.transactions {
        if tx.from == coinbase {
            let r = row(json!({
                "block_hash": block.hash,
                "block_index": block.index,
                "miner": tx.to.as_str(),
                "amount": tx.amount,
                "difficulty": block.difficulty,
                "nonce": block.nonce,
                "timestamp": block.timestamp,
                "origin": origin.as_str(),
            }));
            bounded(
                &inner.cfg,
                "upsert_reward",
                inner.store.upsert(tables::MINING_REWARDS, r, "block_hash"),
            )
            .await?;
            rewards += 1;
        } else {
            let r = transaction_row(tx, block, origin);
            bounded(
                &inner.cfg,
                "upsert_transaction",
                inner.store.upsert(tables::TRANSACTIONS, r, "hash"),
            )
            .await?;
            txs += 1;
        }
    }
    Ok((txs, rewards))
}

fn transaction_row(tx: &crate::ledger::Transaction, block: &Block, origin: &Address) -> Row {
    row(json!({
        "hash": tx.hash,
        "from_address": tx.from.as_str(),
        "to_address": tx.to.as_str(),
        "amount": tx.amount,
        "kind": tx.kind.as_str(),
        "status": tx.status,
        "timestamp": tx.timestamp,
        "block_hash": block.hash,
        "block_index": block.index,
        "origin": origin.as_str(),
    }))
}

fn str_field(row: &Row, key: &str) -> Option<String> {
    row.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Maps a change row from a node-facing table to the event it announces.
pub fn event_from_row(table: &str, row: &Row) -> Option<NodeEvent> {
    match table {
        tables::TRANSACTIONS => Some(NodeEvent::TransactionConfirmed {
            hash: str_field(row, "hash")?,
            block_hash: str_field(row, "block_hash").unwrap_or_default(),
            block_index: row.get("block_index").and_then(Value::as_u64).unwrap_or(0),
        }),
        tables::MINING_REWARDS => Some(NodeEvent::MiningReward {
            address: Address(str_field(row, "miner")?),
            block_hash: str_field(row, "block_hash").unwrap_or_default(),
            amount: row.get("amount").and_then(Value::as_f64)?,
            attempts: row.get("attempts").and_then(Value::as_u64).unwrap_or(0),
        }),
        tables::NODES => Some(NodeEvent::NodeStatus {
            address: Address(str_field(row, "node_id")?),
            mining_active: row.get("mining_active").and_then(Value::as_bool).unwrap_or(false),
            chain_length: row.get("chain_length").and_then(Value::as_u64).unwrap_or(0) as usize,
            status: str_field(row, "status").unwrap_or_else(|| "unknown".into()),
        }),
        tables::BALANCES => Some(NodeEvent::BalanceUpdate {
            address: Address(str_field(row, "address")?),
            balance: row.get("balance").and_then(Value::as_f64)?,
            delta: row.get("delta").and_then(Value::as_f64).unwrap_or(0.0),
            reason: "remote".into(),
        }),
        _ => None,
    }
}
