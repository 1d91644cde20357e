//! Bot manager: independent periodic tasks that drive the node on timers.
//!
//! Each bot owns one loop task while active. Lifecycle changes bump the bot's
//! generation; a loop whose generation is stale exits before its next run, so
//! pause and stop never cancel a body that is already running.

use async_trait::async_trait;
use clap::ValueEnum;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::node::Node;
use crate::store::{DataStore, Row};
use crate::types::{synthetic_id, BotId, Metadata};

pub mod tasks;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    Mining,
    Trading,
    Nft,
    Social,
    Analytics,
    Security,
    Engagement,
    Moderation,
}

impl BotKind {
    pub const ALL: [BotKind; 8] = [
        BotKind::Mining,
        BotKind::Trading,
        BotKind::Nft,
        BotKind::Social,
        BotKind::Analytics,
        BotKind::Security,
        BotKind::Engagement,
        BotKind::Moderation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BotKind::Mining => "mining",
            BotKind::Trading => "trading",
            BotKind::Nft => "nft",
            BotKind::Social => "social",
            BotKind::Analytics => "analytics",
            BotKind::Security => "security",
            BotKind::Engagement => "engagement",
            BotKind::Moderation => "moderation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn default_interval_secs(&self) -> u64 {
        match self {
            BotKind::Mining => 30,
            BotKind::Engagement => 45,
            BotKind::Trading => 60,
            BotKind::Social => 90,
            BotKind::Nft => 120,
            BotKind::Security => 180,
            BotKind::Moderation => 240,
            BotKind::Analytics => 300,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BotKind::Mining => "Auto Mining Bot",
            BotKind::Trading => "Market Making Bot",
            BotKind::Nft => "NFT Curator Bot",
            BotKind::Social => "Social Amplifier Bot",
            BotKind::Analytics => "Network Analytics Bot",
            BotKind::Security => "Security Sentinel Bot",
            BotKind::Engagement => "Engagement Booster Bot",
            BotKind::Moderation => "Content Moderation Bot",
        }
    }

    /// Id of the built-in bot of this kind.
    pub fn default_id(&self) -> BotId {
        BotId(format!("{}_bot", self.as_str()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Active,
    Inactive,
    Paused,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    pub interval_secs: u64,
    /// Kind-specific knobs read by the task body.
    #[serde(default)]
    pub params: Metadata,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BotConfigPatch {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Merged key by key into the existing params.
    #[serde(default)]
    pub params: Option<Metadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BotStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub last_duration_ms: u64,
    pub last_error: Option<String>,
}

/// Totals over every registered bot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStats {
    pub bots: usize,
    pub active: usize,
    pub paused: usize,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: BotId,
    pub name: String,
    pub kind: BotKind,
    pub status: BotStatus,
    pub config: BotConfig,
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    pub stats: BotStats,
}

#[derive(Debug, Error, PartialEq)]
pub enum BotError {
    #[error("bot {0} not found")]
    NotFound(BotId),
    #[error("bot interval must be greater than zero")]
    InvalidInterval,
    #[error("no tokio runtime available to schedule bots")]
    NoRuntime,
}

/// What a task body gets to work with on each run.
pub struct BotContext {
    pub bot_id: BotId,
    pub node: Node,
    pub store: Arc<dyn DataStore>,
    pub params: Metadata,
}

impl BotContext {
    /// Stamps a row with `origin`, `bot_id` and `created_at`.
    pub fn stamp(&self, row: Row) -> Row {
        let mut row = row;
        row.insert("origin".into(), self.node.address().as_str().into());
        row.insert("bot_id".into(), self.bot_id.0.clone().into());
        row.insert("created_at".into(), self.node.clock().now_ms().into());
        row
    }

    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.params.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}

#[async_trait]
pub trait BotTask: Send + Sync {
    fn kind(&self) -> BotKind;

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()>;
}

struct BotEntry {
    bot: Bot,
    task: Arc<dyn BotTask>,
    generation: u64,
}

struct ManagerInner {
    bots: DashMap<BotId, BotEntry>,
    node: Node,
    store: Arc<dyn DataStore>,
}

#[derive(Clone)]
pub struct BotManager {
    inner: Arc<ManagerInner>,
}

impl BotManager {
    /// Registers one inactive built-in bot per kind.
    pub fn new(node: Node, store: Arc<dyn DataStore>, intervals: impl Fn(BotKind) -> u64) -> Self {
        let manager = Self {
            inner: Arc::new(ManagerInner {
                bots: DashMap::new(),
                node,
                store,
            }),
        };
        for kind in BotKind::ALL {
            manager.insert(kind.default_id(), kind.label().to_owned(), intervals(kind), tasks::builtin(kind));
        }
        manager
    }

    fn insert(&self, id: BotId, name: String, interval_secs: u64, task: Arc<dyn BotTask>) {
        let bot = Bot {
            id: id.clone(),
            name,
            kind: task.kind(),
            status: BotStatus::Inactive,
            config: BotConfig {
                interval_secs: interval_secs.max(1),
                params: Metadata::new(),
            },
            last_run: None,
            next_run: None,
            stats: BotStats::default(),
        };
        self.inner.bots.insert(
            id,
            BotEntry {
                bot,
                task,
                generation: 0,
            },
        );
    }

    /// Adds a bot with a custom body; it starts inactive.
    pub fn register_bot(&self, name: &str, interval_secs: u64, task: Arc<dyn BotTask>) -> Result<BotId, BotError> {
        if interval_secs == 0 {
            return Err(BotError::InvalidInterval);
        }
        let node = &self.inner.node;
        let id = BotId(synthetic_id("bot", node.clock().now_ms(), node.random().as_ref()));
        self.insert(id.clone(), name.to_owned(), interval_secs, task);
        info!(bot = %id, name, "bot registered");
        Ok(id)
    }

    pub fn start_bot(&self, id: &BotId) -> Result<Bot, BotError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BotError::NoRuntime)?;
        let now_ms = self.inner.node.clock().now_ms();
        let (bot, generation) = {
            let mut entry = self
                .inner
                .bots
                .get_mut(id)
                .ok_or_else(|| BotError::NotFound(id.clone()))?;
            if entry.bot.status == BotStatus::Active {
                return Ok(entry.bot.clone());
            }
            entry.generation += 1;
            entry.bot.status = BotStatus::Active;
            entry.bot.next_run = Some(now_ms + interval_ms(entry.bot.config.interval_secs));
            (entry.bot.clone(), entry.generation)
        };
        runtime.spawn(run_loop(Arc::clone(&self.inner), id.clone(), generation));
        info!(bot = %id, kind = bot.kind.as_str(), interval_secs = bot.config.interval_secs, "bot started");
        Ok(bot)
    }

    pub fn stop_bot(&self, id: &BotId) -> Result<Bot, BotError> {
        self.transition(id, BotStatus::Inactive)
    }

    pub fn pause_bot(&self, id: &BotId) -> Result<Bot, BotError> {
        self.transition(id, BotStatus::Paused)
    }

    fn transition(&self, id: &BotId, status: BotStatus) -> Result<Bot, BotError> {
        let mut entry = self
            .inner
            .bots
            .get_mut(id)
            .ok_or_else(|| BotError::NotFound(id.clone()))?;
        if entry.bot.status != status {
            entry.generation += 1;
            entry.bot.status = status;
            // the loop exits on its own; a running body is left to finish
            entry.bot.next_run = None;
            info!(bot = %id, status = ?status, "bot status changed");
        }
        Ok(entry.bot.clone())
    }

    pub fn update_bot_config(&self, id: &BotId, patch: BotConfigPatch) -> Result<Bot, BotError> {
        if patch.interval_secs == Some(0) {
            return Err(BotError::InvalidInterval);
        }
        let now_ms = self.inner.node.clock().now_ms();
        let mut entry = self
            .inner
            .bots
            .get_mut(id)
            .ok_or_else(|| BotError::NotFound(id.clone()))?;
        if let Some(secs) = patch.interval_secs {
            entry.bot.config.interval_secs = secs;
            if entry.bot.status == BotStatus::Active {
                entry.bot.next_run = Some(now_ms + interval_ms(secs));
            }
        }
        if let Some(params) = patch.params {
            entry.bot.config.params.extend(params);
        }
        debug!(bot = %id, config = ?entry.bot.config, "bot config updated");
        Ok(entry.bot.clone())
    }

    pub fn get_bot_status(&self, id: &BotId) -> Option<Bot> {
        self.inner.bots.get(id).map(|e| e.bot.clone())
    }

    pub fn get_all_bots(&self) -> Vec<Bot> {
        let mut bots: Vec<Bot> = self.inner.bots.iter().map(|e| e.bot.clone()).collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        bots
    }

    pub fn get_bot_stats(&self) -> FleetStats {
        self.inner.bots.iter().fold(FleetStats::default(), |mut acc, e| {
            acc.bots += 1;
            match e.bot.status {
                BotStatus::Active => acc.active += 1,
                BotStatus::Paused => acc.paused += 1,
                BotStatus::Inactive => {}
            }
            acc.total_runs += e.bot.stats.total_runs;
            acc.successful_runs += e.bot.stats.successful_runs;
            acc.failed_runs += e.bot.stats.failed_runs;
            acc
        })
    }

    /// Runs the body once now, whatever the bot's status, with the usual accounting.
    pub async fn run_bot_now(&self, id: &BotId) -> Result<BotStats, BotError> {
        let (task, params) = {
            let entry = self
                .inner
                .bots
                .get(id)
                .ok_or_else(|| BotError::NotFound(id.clone()))?;
            (Arc::clone(&entry.task), entry.bot.config.params.clone())
        };
        execute(&self.inner, id, task, params).await;
        self.get_bot_status(id)
            .map(|bot| bot.stats)
            .ok_or_else(|| BotError::NotFound(id.clone()))
    }

    /// Deactivates every bot; used on session shutdown.
    pub fn stop_all(&self) {
        let ids: Vec<BotId> = self.inner.bots.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop_bot(&id) {
                debug!(bot = %id, error = %e, "bot gone before stop");
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .bots
            .iter()
            .filter(|e| e.bot.status == BotStatus::Active)
            .count()
    }
}

fn interval_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

/// Returns the task and params if `id` is still active under `generation`.
fn current(inner: &ManagerInner, id: &BotId, generation: u64) -> Option<(Arc<dyn BotTask>, Metadata, u64)> {
    let entry = inner.bots.get(id)?;
    if entry.generation != generation || entry.bot.status != BotStatus::Active {
        return None;
    }
    Some((
        Arc::clone(&entry.task),
        entry.bot.config.params.clone(),
        entry.bot.config.interval_secs,
    ))
}

async fn run_loop(inner: Arc<ManagerInner>, id: BotId, generation: u64) {
    loop {
        let Some((_, _, interval_secs)) = current(&inner, &id, generation) else {
            break;
        };
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
        let Some((task, params, _)) = current(&inner, &id, generation) else {
            break;
        };
        execute(&inner, &id, task, params).await;
    }
    debug!(bot = %id, generation, "bot loop exited");
}

async fn execute(inner: &ManagerInner, id: &BotId, task: Arc<dyn BotTask>, params: Metadata) {
    let ctx = BotContext {
        bot_id: id.clone(),
        node: inner.node.clone(),
        store: Arc::clone(&inner.store),
        params,
    };
    let started = Instant::now();
    let result = match AssertUnwindSafe(task.run(&ctx)).catch_unwind().await {
        Ok(r) => r,
        Err(_) => Err(anyhow::anyhow!("bot body panicked")),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let now_ms = inner.node.clock().now_ms();
    let telemetry = inner.node.telemetry();
    telemetry.incr("bots.runs");
    telemetry.record_latency_ms("bots.run_ms", elapsed_ms);

    let Some(mut entry) = inner.bots.get_mut(id) else {
        return;
    };
    let bot = &mut entry.bot;
    bot.stats.total_runs += 1;
    bot.stats.last_duration_ms = elapsed_ms;
    match &result {
        Ok(()) => {
            bot.stats.successful_runs += 1;
            bot.stats.last_error = None;
            debug!(bot = %id, kind = bot.kind.as_str(), elapsed_ms, "bot run succeeded");
        }
        Err(e) => {
            bot.stats.failed_runs += 1;
            bot.stats.last_error = Some(e.to_string());
            telemetry.incr("bots.failed");
            warn!(bot = %id, kind = bot.kind.as_str(), error = %e, "bot run failed");
        }
    }
    bot.last_run = Some(now_ms);
    bot.next_run = match bot.status {
        BotStatus::Active => Some(now_ms + interval_ms(bot.config.interval_secs)),
        _ => None,
    };
}
