use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

use crate::types::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BalanceUpdate,
    TransactionConfirmed,
    MiningReward,
    NodeStatus,
    SyncError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BalanceUpdate => "balance_update",
            EventKind::TransactionConfirmed => "transaction_confirmed",
            EventKind::MiningReward => "mining_reward",
            EventKind::NodeStatus => "node_status",
            EventKind::SyncError => "sync_error",
        }
    }
}

/// Everything the host can observe flows through this enum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    BalanceUpdate {
        address: Address,
        balance: f64,
        delta: f64,
        reason: String,
    },
    TransactionConfirmed {
        hash: String,
        block_hash: String,
        block_index: u64,
    },
    MiningReward {
        address: Address,
        block_hash: String,
        amount: f64,
        attempts: u64,
    },
    NodeStatus {
        address: Address,
        mining_active: bool,
        chain_length: usize,
        status: String,
    },
    SyncError {
        operation: String,
        message: String,
    },
}

impl NodeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NodeEvent::BalanceUpdate { .. } => EventKind::BalanceUpdate,
            NodeEvent::TransactionConfirmed { .. } => EventKind::TransactionConfirmed,
            NodeEvent::MiningReward { .. } => EventKind::MiningReward,
            NodeEvent::NodeStatus { .. } => EventKind::NodeStatus,
            NodeEvent::SyncError { .. } => EventKind::SyncError,
        }
    }
}

pub type Listener = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct BusInner {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

/// Kind-keyed listener registry with synchronous fan-out.
///
/// Emission snapshots the listener list and releases the lock before calling
/// out, so listeners may call back into the node or the bus. A listener that
/// panics is logged and skipped. Every event is also forwarded to a broadcast
/// channel for async consumers (websocket relays).
pub struct EventBus {
    inner: RwLock<BusInner>,
    stream: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(BusInner::default()),
            stream,
        }
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        let mut guard = self.inner.write();
        let id = ListenerId(guard.next_id);
        guard.next_id = guard.next_id.wrapping_add(1);
        guard
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener; returns whether it was registered under `kind`.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut guard = self.inner.write();
        let Some(list) = guard.listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        before != list.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .read()
            .listeners
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Calls every listener of the event's kind; returns how many returned normally.
    pub fn emit(&self, event: &NodeEvent) -> usize {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .inner
            .read()
            .listeners
            .get(&kind)
            .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();

        let mut delivered = 0usize;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(kind = kind.as_str(), "event listener panicked"),
            }
        }
        let _ = self.stream.send(event.clone());
        delivered
    }

    pub fn stream(&self) -> broadcast::Receiver<NodeEvent> {
        self.stream.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status() -> NodeEvent {
        NodeEvent::NodeStatus {
            address: Address::from("node"),
            mining_active: false,
            chain_length: 1,
            status: "idle".into(),
        }
    }

    #[test]
    fn fans_out_only_to_matching_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on(EventKind::NodeStatus, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = hits.clone();
        bus.on(EventKind::SyncError, move |_| {
            h.fetch_add(100, Ordering::SeqCst);
        });
        assert_eq!(bus.emit(&status()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::NodeStatus, |_| panic!("listener bug"));
        let h = hits.clone();
        bus.on(EventKind::NodeStatus, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.emit(&status()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new();
        let id = bus.on(EventKind::NodeStatus, |_| {});
        assert_eq!(bus.listener_count(EventKind::NodeStatus), 1);
        assert!(bus.off(EventKind::NodeStatus, id));
        assert!(!bus.off(EventKind::NodeStatus, id));
        assert!(!bus.off(EventKind::SyncError, id));
        assert_eq!(bus.emit(&status()), 0);
    }

    #[test]
    fn listeners_may_reenter_the_bus() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.on(EventKind::NodeStatus, move |_| {
            inner.on(EventKind::SyncError, |_| {});
        });
        bus.emit(&status());
        assert_eq!(bus.listener_count(EventKind::SyncError), 1);
    }
}
