use crate::consensus::{ActionRecord, RejectReason};
use crate::store::{tables, DataStore, Row};
use crate::types::Address;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuditEvent {
    Action {
        record: ActionRecord,
        reward: f64,
    },
    Rejected {
        record: ActionRecord,
        reason: RejectReason,
    },
    BlockMined {
        index: u64,
        hash: String,
        miner: Address,
        tx_count: usize,
        attempts: u64,
        timestamp: i64,
    },
}

impl AuditEvent {
    pub fn action(record: ActionRecord, reward: f64) -> Self {
        Self::Action { record, reward }
    }

    pub fn rejected(record: ActionRecord, reason: RejectReason) -> Self {
        Self::Rejected { record, reason }
    }

    pub fn block_mined(index: u64, hash: String, miner: Address, tx_count: usize, attempts: u64, timestamp: i64) -> Self {
        Self::BlockMined {
            index,
            hash,
            miner,
            tx_count,
            attempts,
            timestamp,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// No-op audit sink (tests, offline runs).
#[derive(Clone, Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fan-out sink for emitting to multiple audit backends.
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for CompositeAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        for sink in &self.sinks {
            sink.emit(event.clone())?;
        }
        Ok(())
    }
}

/// Writes accepted and rejected actions as `action_records` rows.
///
/// The insert runs on a spawned task; `emit` only fails when no tokio runtime
/// is available. Mined blocks are persisted by the sync loop and skipped here.
pub struct StoreAuditSink {
    store: Arc<dyn DataStore>,
    origin: Address,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn DataStore>, origin: Address) -> Self {
        Self { store, origin }
    }

    fn to_row(&self, event: &AuditEvent) -> Option<Row> {
        let value = match event {
            AuditEvent::Action { record, reward } => json!({
                "actor_id": record.actor_id.0,
                "action_type": record.kind.as_str(),
                "timestamp": record.timestamp,
                "metadata": record.metadata,
                "reward_multiplier": record.reward_multiplier,
                "reward": reward,
                "accepted": true,
                "origin": self.origin.as_str(),
            }),
            AuditEvent::Rejected { record, reason } => json!({
                "actor_id": record.actor_id.0,
                "action_type": record.kind.as_str(),
                "timestamp": record.timestamp,
                "metadata": record.metadata,
                "reward_multiplier": record.reward_multiplier,
                "reward": 0.0,
                "accepted": false,
                "reason": reason,
                "origin": self.origin.as_str(),
            }),
            AuditEvent::BlockMined { .. } => return None,
        };
        value.as_object().cloned()
    }
}

impl AuditSink for StoreAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let Some(row) = self.to_row(&event) else {
            return Ok(());
        };
        let handle = tokio::runtime::Handle::try_current().context("audit sink needs a tokio runtime")?;
        let store = Arc::clone(&self.store);
        handle.spawn(async move {
            if let Err(e) = store.insert(tables::ACTION_RECORDS, row).await {
                tracing::warn!(error = %e, "audit row dropped");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{ActionKind, ActorId, Metadata};
    use parking_lot::Mutex;

    fn record() -> ActionRecord {
        ActionRecord {
            kind: ActionKind::from("page_visit"),
            timestamp: 1_000,
            actor_id: ActorId("alice".into()),
            metadata: Metadata::new(),
            reward_multiplier: 1.2,
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<AuditEvent>>);

    impl AuditSink for Collect {
        fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
            self.0.lock().push(event);
            Ok(())
        }
    }

    #[test]
    fn composite_fans_out() {
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        let sink = CompositeAuditSink::new(vec![a.clone(), b.clone(), Arc::new(NoopAuditSink)]);
        sink.emit(AuditEvent::action(record(), 0.6)).unwrap();
        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn store_sink_writes_action_rows() {
        let store = Arc::new(MemoryStore::new());
        let sink = StoreAuditSink::new(store.clone(), Address::from("node_x"));
        sink.emit(AuditEvent::action(record(), 0.6)).unwrap();
        sink.emit(AuditEvent::rejected(
            record(),
            RejectReason::BurstDetected { recent: 10, window_ms: 1_000 },
        ))
        .unwrap();
        sink.emit(AuditEvent::block_mined(1, "00ab".into(), Address::from("node_x"), 1, 5, 1_000))
            .unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let rows = store.rows(tables::ACTION_RECORDS);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["accepted"], json!(true));
        assert_eq!(rows[1]["accepted"], json!(false));
        assert_eq!(rows[0]["origin"], json!("node_x"));
    }

    #[test]
    fn store_sink_without_runtime_errors() {
        let sink = StoreAuditSink::new(Arc::new(MemoryStore::new()), Address::from("n"));
        assert!(sink.emit(AuditEvent::action(record(), 0.1)).is_err());
    }
}
