use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ChangeCallback, ChangeEvent, ChangeFeed, ChangeKind, DataStore, Filter, Row, StoreError, SubscriptionHandle};

/// In-process store: named tables of JSON rows plus a change feed.
///
/// `set_available(false)` makes every call fail with
/// [`StoreError::Unavailable`], which is how tests exercise the best-effort
/// paths of the sync loop and the bots.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    feed: ChangeFeed,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(Vec::len).unwrap_or(0)
    }

    /// Snapshot of a table, bypassing availability (for assertions).
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        self.check()?;
        let guard = self.tables.read();
        let mut rows: Vec<Row> = guard
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        drop(guard);

        if let Some(column) = &filter.order_desc {
            rows.sort_by(|a, b| {
                let a = a.get(column).and_then(|v| v.as_f64()).unwrap_or(f64::MIN);
                let b = b.get(column).and_then(|v| v.as_f64()).unwrap_or(f64::MIN);
                b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<(), StoreError> {
        self.check()?;
        self.tables
            .write()
            .entry(table.to_owned())
            .or_default()
            .push(row.clone());
        self.feed.publish(ChangeEvent {
            table: table.to_owned(),
            kind: ChangeKind::Insert,
            row,
        });
        Ok(())
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError> {
        self.check()?;
        let mut changed = Vec::new();
        {
            let mut guard = self.tables.write();
            if let Some(rows) = guard.get_mut(table) {
                for r in rows.iter_mut().filter(|r| filter.matches(r)) {
                    for (k, v) in &patch {
                        r.insert(k.clone(), v.clone());
                    }
                    changed.push(r.clone());
                }
            }
        }
        let count = changed.len();
        for row in changed {
            self.feed.publish(ChangeEvent {
                table: table.to_owned(),
                kind: ChangeKind::Update,
                row,
            });
        }
        Ok(count)
    }

    async fn upsert(&self, table: &str, row: Row, conflict_key: &str) -> Result<(), StoreError> {
        self.check()?;
        let key = row
            .get(conflict_key)
            .cloned()
            .ok_or_else(|| StoreError::MissingConflictKey(conflict_key.to_owned()))?;

        let (kind, stored) = {
            let mut guard = self.tables.write();
            let rows = guard.entry(table.to_owned()).or_default();
            match rows.iter_mut().find(|r| r.get(conflict_key) == Some(&key)) {
                Some(existing) => {
                    for (k, v) in row {
                        existing.insert(k, v);
                    }
                    (ChangeKind::Update, existing.clone())
                }
                None => {
                    rows.push(row.clone());
                    (ChangeKind::Insert, row)
                }
            }
        };
        self.feed.publish(ChangeEvent {
            table: table.to_owned(),
            kind,
            row: stored,
        });
        Ok(())
    }

    fn subscribe(&self, table: &str, kinds: &[ChangeKind], callback: ChangeCallback) -> SubscriptionHandle {
        self.feed.subscribe(table, kinds, callback)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.feed.unsubscribe(handle)
    }

    fn unsubscribe_all(&self) {
        self.feed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::row;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn upsert_inserts_then_merges() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        store.subscribe(
            "nodes",
            &[ChangeKind::Insert, ChangeKind::Update],
            Arc::new(move |e: ChangeEvent| s.lock().push(e.kind)),
        );

        store
            .upsert("nodes", row(json!({"node_id": "n1", "balance": 1.0})), "node_id")
            .await
            .unwrap();
        store
            .upsert("nodes", row(json!({"node_id": "n1", "balance": 2.5})), "node_id")
            .await
            .unwrap();

        let rows = store.select("nodes", &Filter::new().eq("node_id", "n1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["balance"], json!(2.5));
        assert_eq!(*seen.lock(), vec![ChangeKind::Insert, ChangeKind::Update]);
    }

    #[tokio::test]
    async fn upsert_requires_conflict_key() {
        let store = MemoryStore::new();
        let err = store.upsert("nodes", row(json!({"balance": 1})), "node_id").await.unwrap_err();
        assert!(matches!(err, StoreError::MissingConflictKey(_)));
    }

    #[tokio::test]
    async fn update_patches_matching_rows_only() {
        let store = MemoryStore::new();
        for (id, status) in [("a", "pending"), ("b", "pending"), ("c", "confirmed")] {
            store
                .insert("transactions", row(json!({"hash": id, "status": status})))
                .await
                .unwrap();
        }
        let changed = store
            .update(
                "transactions",
                &Filter::new().eq("status", "pending"),
                row(json!({"status": "confirmed"})),
            )
            .await
            .unwrap();
        assert_eq!(changed, 2);
        let confirmed = store
            .select("transactions", &Filter::new().eq("status", "confirmed"))
            .await
            .unwrap();
        assert_eq!(confirmed.len(), 3);
    }

    #[tokio::test]
    async fn select_orders_and_limits() {
        let store = MemoryStore::new();
        for v in [3, 1, 2] {
            store.insert("t", row(json!({"v": v}))).await.unwrap();
        }
        let rows = store.select("t", &Filter::new().order_desc("v").limit(2)).await.unwrap();
        let vs: Vec<i64> = rows.iter().map(|r| r["v"].as_i64().unwrap()).collect();
        assert_eq!(vs, vec![3, 2]);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.insert("t", Row::new()).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.select("t", &Filter::new()).await.is_err());
        store.set_available(true);
        assert!(store.insert("t", Row::new()).await.is_ok());
        assert_eq!(store.row_count("t"), 1);
    }
}
