//! Session: the composition root. Owns one node and everything wired to it.
//!
//! Nothing in the crate is a global; two sessions in one process share no
//! state unless they are handed the same store.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditSink, NoopAuditSink, StoreAuditSink};
use crate::bots::{BotError, BotManager};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, SimConfig, StoreBackend, StoreSection};
use crate::events::EventBus;
use crate::node::{Node, NodeDeps, NodeError};
use crate::random::{RandomSource, ThreadRandom};
use crate::store::{DataStore, MemoryStore, PostgrestStore, StoreError};
use crate::sync::{RealtimeSync, SyncError};
use crate::telemetry::TelemetryHandle;
use crate::types::{synthetic_id, Address};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Bot(#[from] BotError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Builds the store backend named by the config.
pub fn build_store(cfg: &StoreSection) -> Result<Arc<dyn DataStore>, SessionError> {
    match cfg.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Postgrest => {
            let pg = cfg.postgrest.as_ref().ok_or_else(|| {
                ConfigError::Validation("postgrest backend requires store.postgrest.url".into())
            })?;
            Ok(Arc::new(PostgrestStore::new(pg)?))
        }
    }
}

pub struct Session {
    config: SimConfig,
    store: Arc<dyn DataStore>,
    node: Node,
    bots: BotManager,
    sync: RealtimeSync,
}

impl Session {
    pub fn new(config: SimConfig, store: Arc<dyn DataStore>) -> Result<Self, SessionError> {
        Self::with_sources(config, store, Arc::new(SystemClock), Arc::new(ThreadRandom))
    }

    /// Validates `config` and builds the store it names.
    pub fn from_config(config: SimConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let store = build_store(&config.store)?;
        Self::new(config, store)
    }

    pub fn with_sources(
        mut config: SimConfig,
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        // fixed up front so audit rows and sync rows agree on the origin
        let address = match config.node.address.as_deref().map(str::trim) {
            Some(a) if !a.is_empty() => a.to_owned(),
            _ => synthetic_id("node", clock.now_ms(), random.as_ref()),
        };
        config.node.address = Some(address.clone());

        let audit: Arc<dyn AuditSink> = if config.store.audit_actions {
            Arc::new(StoreAuditSink::new(Arc::clone(&store), Address(address)))
        } else {
            Arc::new(NoopAuditSink)
        };
        let node = Node::new(
            &config,
            NodeDeps {
                clock,
                random,
                events: Arc::new(EventBus::new()),
                telemetry: TelemetryHandle::from_config(config.telemetry.clone()),
                audit,
            },
        );
        let intervals = config.bots.clone();
        let bots = BotManager::new(node.clone(), Arc::clone(&store), move |kind| {
            intervals.interval_secs(kind)
        });
        let sync = RealtimeSync::new(node.clone(), Arc::clone(&store), config.sync.clone());
        info!(
            address = %node.address(),
            backend = config.store.backend.as_str(),
            "session assembled"
        );
        Ok(Self {
            config,
            store,
            node,
            bots,
            sync,
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn bots(&self) -> &BotManager {
        &self.bots
    }

    pub fn sync(&self) -> &RealtimeSync {
        &self.sync
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.node.events()
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        self.node.telemetry()
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Starts whatever the config asks for: mining, autostart bots, sync.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.config.mining.auto_start {
            self.node.start_mining()?;
        }
        for kind in &self.config.bots.autostart {
            self.bots.start_bot(&kind.default_id())?;
        }
        if self.config.sync.enabled {
            self.sync.attach_subscriptions();
            self.sync.start()?;
        }
        info!(
            mining = self.node.is_mining(),
            bots = self.bots.active_count(),
            sync = self.sync.is_running(),
            "session started"
        );
        Ok(())
    }

    /// Stops bots, sync and mining, then drops every store subscription.
    pub async fn shutdown(&self) {
        self.bots.stop_all();
        self.sync.stop();
        self.node.stop_mining();
        if self.config.sync.enabled {
            if let Err(e) = self.sync.sync_once().await {
                warn!(error = %e, "final sync failed");
            }
        }
        self.sync.detach_subscriptions();
        self.store.unsubscribe_all();
        info!(address = %self.node.address(), "session shut down");
    }
}
