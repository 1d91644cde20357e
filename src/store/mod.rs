//! Generic data-access seam to the external relational store.
//!
//! The simulator never owns persistence; it talks to a [`DataStore`] through
//! `select`/`insert`/`update`/`upsert` and a change-notification feed. Rows are
//! plain JSON objects.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;
pub mod postgrest;

pub use memory::MemoryStore;
pub use postgrest::{PostgrestConfig, PostgrestStore};

pub type Row = serde_json::Map<String, Value>;

/// Tables the simulator writes to.
pub mod tables {
    pub const NODES: &str = "nodes";
    pub const TRANSACTIONS: &str = "transactions";
    pub const MINING_REWARDS: &str = "mining_rewards";
    pub const BALANCES: &str = "balances";
    pub const ACTION_RECORDS: &str = "action_records";
    pub const MINING_SESSIONS: &str = "mining_sessions";
    pub const TRADES: &str = "trades";
    pub const NFT_LISTINGS: &str = "nft_listings";
    pub const SOCIAL_ENGAGEMENTS: &str = "social_engagements";
    pub const ANALYTICS_SNAPSHOTS: &str = "analytics_snapshots";
    pub const SECURITY_SCANS: &str = "security_scans";
    pub const ENGAGEMENT_EVENTS: &str = "engagement_events";
    pub const MODERATION_ACTIONS: &str = "moderation_actions";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("request failed: {0}")]
    Http(String),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode store response: {0}")]
    Decode(String),
    #[error("row is missing conflict key `{0}`")]
    MissingConflictKey(String),
    #[error("invalid store url: {0}")]
    Url(String),
}

/// Equality filter with optional ordering and limit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub eq: Vec<(String, Value)>,
    pub order_desc: Option<String>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order_desc = Some(column.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.eq
            .iter()
            .all(|(col, value)| row.get(col).map_or(false, |v| v == value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row: Row,
}

pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError>;

    async fn insert(&self, table: &str, row: Row) -> Result<(), StoreError>;

    /// Applies `patch` to every matching row; returns how many rows changed.
    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError>;

    async fn upsert(&self, table: &str, row: Row, conflict_key: &str) -> Result<(), StoreError>;

    fn subscribe(&self, table: &str, kinds: &[ChangeKind], callback: ChangeCallback) -> SubscriptionHandle;

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;

    fn unsubscribe_all(&self);
}

struct Subscriber {
    id: SubscriptionHandle,
    table: String,
    kinds: Vec<ChangeKind>,
    callback: ChangeCallback,
}

#[derive(Default)]
struct FeedInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Shared change-notification fan-out used by the store backends.
#[derive(Clone, Default)]
pub struct ChangeFeed {
    inner: Arc<RwLock<FeedInner>>,
}

impl ChangeFeed {
    pub fn subscribe(&self, table: &str, kinds: &[ChangeKind], callback: ChangeCallback) -> SubscriptionHandle {
        let mut guard = self.inner.write();
        let id = SubscriptionHandle(guard.next_id);
        guard.next_id = guard.next_id.wrapping_add(1);
        guard.subscribers.push(Subscriber {
            id,
            table: table.to_owned(),
            kinds: kinds.to_vec(),
            callback,
        });
        id
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut guard = self.inner.write();
        let before = guard.subscribers.len();
        guard.subscribers.retain(|s| s.id != handle);
        before != guard.subscribers.len()
    }

    pub fn clear(&self) {
        self.inner.write().subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to matching subscribers outside the lock.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let targets: Vec<ChangeCallback> = self
            .inner
            .read()
            .subscribers
            .iter()
            .filter(|s| s.table == event.table && s.kinds.contains(&event.kind))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in &targets {
            callback(event.clone());
        }
        targets.len()
    }
}

/// Builds a [`Row`] from a `json!` object literal; non-objects become empty rows.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn filter_matches_on_all_columns() {
        let r = row(json!({"node_id": "n1", "status": "confirmed"}));
        assert!(Filter::new().eq("node_id", "n1").matches(&r));
        assert!(!Filter::new().eq("node_id", "n1").eq("status", "pending").matches(&r));
        assert!(!Filter::new().eq("missing", 1).matches(&r));
        assert!(Filter::new().matches(&r));
    }

    #[test]
    fn feed_routes_by_table_and_kind() {
        let feed = ChangeFeed::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = feed.subscribe(
            "transactions",
            &[ChangeKind::Insert],
            Arc::new(move |_: ChangeEvent| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let event = |table: &str, kind| ChangeEvent {
            table: table.into(),
            kind,
            row: Row::new(),
        };
        assert_eq!(feed.publish(event("transactions", ChangeKind::Insert)), 1);
        assert_eq!(feed.publish(event("transactions", ChangeKind::Update)), 0);
        assert_eq!(feed.publish(event("nodes", ChangeKind::Insert)), 0);
        assert!(feed.unsubscribe(handle));
        assert_eq!(feed.publish(event("transactions", ChangeKind::Insert)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
