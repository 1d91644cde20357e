//! Built-in bot bodies. Each run drives the node a little and writes one or
//! more synthetic rows to its table; a store failure fails the run.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::{BotContext, BotKind, BotTask};
use crate::ledger::TxKind;
use crate::node::ACTOR_ID_KEY;
use crate::store::{row, tables, Filter};
use crate::types::{synthetic_id, Address, Metadata};

pub fn builtin(kind: BotKind) -> Arc<dyn BotTask> {
    match kind {
        BotKind::Mining => Arc::new(MiningBot),
        BotKind::Trading => Arc::new(TradingBot),
        BotKind::Nft => Arc::new(NftBot),
        BotKind::Social => Arc::new(SocialBot),
        BotKind::Analytics => Arc::new(AnalyticsBot),
        BotKind::Security => Arc::new(SecurityBot),
        BotKind::Engagement => Arc::new(EngagementBot),
        BotKind::Moderation => Arc::new(ModerationBot),
    }
}

fn pick<'a>(ctx: &BotContext, options: &[&'a str]) -> &'a str {
    let i = ctx.node.random().range_u64(0, options.len() as u64) as usize;
    options.get(i).copied().unwrap_or_default()
}

fn synthetic_user(ctx: &BotContext) -> String {
    synthetic_id("user", ctx.node.clock().now_ms(), ctx.node.random().as_ref())
}

fn actor_metadata(actor: &str, engagement: Option<f64>) -> Metadata {
    let mut m = Metadata::new();
    m.insert(ACTOR_ID_KEY.into(), actor.into());
    if let Some(score) = engagement {
        m.insert(crate::rewards::ENGAGEMENT_SCORE_KEY.into(), score.into());
    }
    m
}

/// Keeps the node mining (unless `auto_start` is false) and logs a session row.
pub struct MiningBot;

#[async_trait]
impl BotTask for MiningBot {
    fn kind(&self) -> BotKind {
        BotKind::Mining
    }

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()> {
        if ctx.param_bool("auto_start", true) && !ctx.node.is_mining() {
            ctx.node.start_mining().context("starting miner")?;
        }
        let stats = ctx.node.get_network_stats();
        let r = ctx.stamp(row(json!({
            "node_id": stats.address.as_str(),
            "mining_active": stats.mining_active,
            "blocks_mined": stats.blocks_mined,
            "hash_rate": stats.hash_rate,
            "chain_length": stats.chain_length,
            "difficulty": stats.difficulty,
            "balance": stats.balance,
        })));
        ctx.store.insert(tables::MINING_SESSIONS, r).await?;
        Ok(())
    }
}

/// Places a random buy or sell as a `trade` transaction.
pub struct TradingBot;

#[async_trait]
impl BotTask for TradingBot {
    fn kind(&self) -> BotKind {
        BotKind::Trading
    }

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()> {
        let random = ctx.node.random();
        let side = if random.chance(0.5) { "buy" } else { "sell" };
        let amount = random.range_f64(0.1, ctx.param_f64("max_amount", 5.0).max(0.2));
        let price = random.range_f64(0.8, 1.2) * ctx.param_f64("reference_price", 1.0);
        let counterparty = Address(synthetic_id("trader", ctx.node.clock().now_ms(), random.as_ref()));

        let tx = ctx.node.create_transaction(counterparty.clone(), amount, TxKind::Trade)?;
        ctx.node.record_action("transaction", Metadata::new());
        let r = ctx.stamp(row(json!({
            "tx_hash": tx.hash,
            "side": side,
            "amount": amount,
            "price": price,
            "counterparty": counterparty.as_str(),
        })));
        ctx.store.insert(tables::TRADES, r).await?;
        debug!(side, amount, price, "trade placed");
        Ok(())
    }
}

const COLLECTIONS: &[&str] = &["Genesis", "Nebula", "Ledger Lights", "Validators"];
const RARITIES: &[&str] = &["common", "rare", "epic", "legendary"];

/// Mints an NFT and lists it.
pub struct NftBot;

#[async_trait]
impl BotTask for NftBot {
    fn kind(&self) -> BotKind {
        BotKind::Nft
    }

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()> {
        let collection = pick(ctx, COLLECTIONS);
        let rarity = pick(ctx, RARITIES);
        let mut metadata = Metadata::new();
        metadata.insert("collection".into(), collection.into());
        metadata.insert("rarity".into(), rarity.into());
        let token_id = ctx.node.mint_nft(metadata, ctx.param_f64("royalty", 0.05));
        let price = ctx.node.random().range_f64(1.0, 50.0);
        let r = ctx.stamp(row(json!({
            "token_id": token_id,
            "collection": collection,
            "rarity": rarity,
            "price": price,
            "status": "listed",
        })));
        ctx.store.insert(tables::NFT_LISTINGS, r).await?;
        Ok(())
    }
}

const PLATFORMS: &[&str] = &["twitter", "discord", "telegram", "reddit"];

/// Simulates a user sharing content.
pub struct SocialBot;

#[async_trait]
impl BotTask for SocialBot {
    fn kind(&self) -> BotKind {
        BotKind::Social
    }

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()> {
        let user = synthetic_user(ctx);
        let engagement = ctx.node.random().range_f64(0.0, 100.0);
        let outcome = ctx
            .node
            .record_action("social_share", actor_metadata(&user, Some(engagement)));
        let reach = ctx.node.random().range_u64(10, 5_000);
        let r = ctx.stamp(row(json!({
            "user_id": user,
            "platform": pick(ctx, PLATFORMS),
            "engagement_score": engagement,
            "reach": reach,
            "reward": outcome.reward,
            "accepted": outcome.accepted,
        })));
        ctx.store.insert(tables::SOCIAL_ENGAGEMENTS, r).await?;
        Ok(())
    }
}

/// Snapshots network stats.
pub struct AnalyticsBot;

#[async_trait]
impl BotTask for AnalyticsBot {
    fn kind(&self) -> BotKind {
        BotKind::Analytics
    }

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()> {
        let stats = ctx.node.get_network_stats();
        let mut r = row(serde_json::to_value(&stats)?);
        r.insert("profiles".into(), (ctx.node.consensus().profile_count() as u64).into());
        ctx.store
            .insert(tables::ANALYTICS_SNAPSHOTS, ctx.stamp(r))
            .await?;
        Ok(())
    }
}

/// Flag actors scoring under this. With default consensus penalties the
/// lowest score is 0.56 (unusual hours 0.8 times low diversity 0.7).
pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.6;

/// Flags actors with low behavior scores and docks their reputation.
pub struct SecurityBot;

#[async_trait]
impl BotTask for SecurityBot {
    fn kind(&self) -> BotKind {
        BotKind::Security
    }

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()> {
        let threshold = ctx.param_f64("score_threshold", DEFAULT_SCORE_THRESHOLD);
        let penalty = ctx.param_f64("reputation_penalty", 0.05);
        let consensus = ctx.node.consensus();
        let flagged = consensus.suspicious_actors(threshold);
        for (actor, score) in &flagged {
            let reputation = consensus.adjust_reputation(actor, -penalty);
            debug!(%actor, score, ?reputation, "actor flagged");
        }
        let risk_score = ctx.node.random().range_f64(0.0, 0.3) + 0.1 * flagged.len() as f64;
        let r = ctx.stamp(row(json!({
            "profiles_scanned": consensus.profile_count(),
            "flagged": flagged.iter().map(|(a, _)| a.0.clone()).collect::<Vec<_>>(),
            "risk_score": risk_score.min(1.0),
            "status": if flagged.is_empty() { "clean" } else { "flagged" },
        })));
        ctx.store.insert(tables::SECURITY_SCANS, r).await?;
        Ok(())
    }
}

const ENGAGEMENT_ACTIONS: &[&str] = &["page_visit", "button_click", "time_spent", "form_submit"];

/// Records a burst-safe trickle of user interactions.
pub struct EngagementBot;

#[async_trait]
impl BotTask for EngagementBot {
    fn kind(&self) -> BotKind {
        BotKind::Engagement
    }

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()> {
        let user = synthetic_user(ctx);
        let kind = pick(ctx, ENGAGEMENT_ACTIONS);
        let outcome = ctx.node.record_action(kind, actor_metadata(&user, None));
        let r = ctx.stamp(row(json!({
            "user_id": user,
            "action_type": kind,
            "reward": outcome.reward,
            "multiplier": outcome.multiplier,
            "accepted": outcome.accepted,
        })));
        ctx.store.insert(tables::ENGAGEMENT_EVENTS, r).await?;
        Ok(())
    }
}

/// Reviews recent social rows and flags a random share of them.
pub struct ModerationBot;

#[async_trait]
impl BotTask for ModerationBot {
    fn kind(&self) -> BotKind {
        BotKind::Moderation
    }

    async fn run(&self, ctx: &BotContext) -> anyhow::Result<()> {
        let recent = ctx
            .store
            .select(
                tables::SOCIAL_ENGAGEMENTS,
                &Filter::new().order_desc("created_at").limit(20),
            )
            .await?;
        let flag_rate = ctx.param_f64("flag_rate", 0.1);
        let mut flagged = 0usize;
        for item in &recent {
            if !ctx.node.random().chance(flag_rate) {
                continue;
            }
            flagged += 1;
            let r = ctx.stamp(row(json!({
                "target_user": item.get("user_id").cloned().unwrap_or_default(),
                "action": "flag",
                "reason": "automated review",
            })));
            ctx.store.insert(tables::MODERATION_ACTIONS, r).await?;
        }
        let summary = ctx.stamp(row(json!({
            "action": "review",
            "reviewed": recent.len(),
            "flagged": flagged,
        })));
        ctx.store.insert(tables::MODERATION_ACTIONS, summary).await?;
        Ok(())
    }
}
