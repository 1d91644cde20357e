//! "AI consensus": a behaviour heuristic that gates rewarded actions and votes.
//!
//! Each actor gets a lazily created [`BehaviorProfile`] holding a bounded FIFO
//! window of its recent actions. Rejections are ordinary [`Verdict`] values,
//! never errors. Profiles live in a `DashMap`, so mutation of one actor's
//! profile is serialized by that key's shard lock while different actors
//! proceed independently.

use chrono::{DateTime, FixedOffset, Timelike};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use crate::types::{ActionKind, ActorId, Metadata};

/// Action kind recorded for governance votes.
pub const GOVERNANCE_VOTE: &str = "governance_vote";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ConsensusConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_initial_score")]
    pub initial_behavior_score: f64,
    #[serde(default = "default_initial_reputation")]
    pub initial_reputation: f64,
    #[serde(default = "default_min_score")]
    pub min_behavior_score: f64,
    #[serde(default = "default_unusual_start")]
    pub unusual_hours_start: u32,
    #[serde(default = "default_unusual_end")]
    pub unusual_hours_end: u32,
    #[serde(default = "default_unusual_penalty")]
    pub unusual_hours_penalty: f64,
    #[serde(default = "default_diversity_min_actions")]
    pub diversity_min_actions: u64,
    #[serde(default = "default_diversity_min_kinds")]
    pub diversity_min_kinds: usize,
    #[serde(default = "default_diversity_penalty")]
    pub diversity_penalty: f64,
    #[serde(default = "default_burst_limit")]
    pub burst_limit: usize,
    #[serde(default = "default_burst_window_ms")]
    pub burst_window_ms: i64,
    #[serde(default = "default_vote_limit")]
    pub vote_limit: usize,
    #[serde(default = "default_vote_window_ms")]
    pub vote_window_ms: i64,
}

const fn default_window_size() -> usize {
    100
}
const fn default_initial_score() -> f64 {
    1.0
}
const fn default_initial_reputation() -> f64 {
    0.5
}
const fn default_min_score() -> f64 {
    0.3
}
const fn default_unusual_start() -> u32 {
    2
}
const fn default_unusual_end() -> u32 {
    6
}
const fn default_unusual_penalty() -> f64 {
    0.8
}
const fn default_diversity_min_actions() -> u64 {
    10
}
const fn default_diversity_min_kinds() -> usize {
    2
}
const fn default_diversity_penalty() -> f64 {
    0.7
}
const fn default_burst_limit() -> usize {
    10
}
const fn default_burst_window_ms() -> i64 {
    1_000
}
const fn default_vote_limit() -> usize {
    5
}
const fn default_vote_window_ms() -> i64 {
    60_000
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            initial_behavior_score: default_initial_score(),
            initial_reputation: default_initial_reputation(),
            min_behavior_score: default_min_score(),
            unusual_hours_start: default_unusual_start(),
            unusual_hours_end: default_unusual_end(),
            unusual_hours_penalty: default_unusual_penalty(),
            diversity_min_actions: default_diversity_min_actions(),
            diversity_min_kinds: default_diversity_min_kinds(),
            diversity_penalty: default_diversity_penalty(),
            burst_limit: default_burst_limit(),
            burst_window_ms: default_burst_window_ms(),
            vote_limit: default_vote_limit(),
            vote_window_ms: default_vote_window_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub actor_id: ActorId,
    pub metadata: Metadata,
    pub reward_multiplier: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub actor_id: ActorId,
    pub created_at: i64,
    pub action_count: u64,
    pub recent_actions: VecDeque<ActionRecord>,
    /// Stored baseline the per-action evaluation starts from.
    pub behavior_score: f64,
    /// Score produced by the most recent evaluation (after penalties).
    pub last_score: f64,
    pub staking_balance: f64,
    pub reputation_score: f64,
}

impl BehaviorProfile {
    fn new(actor_id: ActorId, created_at: i64, cfg: &ConsensusConfig) -> Self {
        Self {
            actor_id,
            created_at,
            action_count: 0,
            recent_actions: VecDeque::with_capacity(cfg.window_size),
            behavior_score: cfg.initial_behavior_score,
            last_score: cfg.initial_behavior_score,
            staking_balance: 0.0,
            reputation_score: cfg.initial_reputation,
        }
    }

    pub fn distinct_recent_kinds(&self) -> usize {
        self.recent_actions
            .iter()
            .map(|a| a.kind.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    fn count_since(&self, since_ms: i64, kind: Option<&str>) -> usize {
        self.recent_actions
            .iter()
            .filter(|a| a.timestamp > since_ms)
            .filter(|a| kind.map_or(true, |k| a.kind.as_str() == k))
            .count()
    }

    fn push(&mut self, action: ActionRecord, window: usize) {
        self.recent_actions.push_back(action);
        while self.recent_actions.len() > window {
            self.recent_actions.pop_front();
        }
        self.action_count += 1;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    LowBehaviorScore { score: f64 },
    BurstDetected { recent: usize, window_ms: i64 },
    VoteWeightExceedsStake { weight: f64, staked: f64 },
    VoteRateExceeded { recent_votes: usize, window_ms: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accepted { score: f64 },
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub actor_id: ActorId,
    pub proposal_id: String,
    pub support: bool,
    pub weight: f64,
    pub timestamp: i64,
}

pub struct ConsensusHeuristic {
    cfg: ConsensusConfig,
    profiles: DashMap<ActorId, BehaviorProfile>,
}

impl ConsensusHeuristic {
    pub fn new(cfg: ConsensusConfig) -> Self {
        Self {
            cfg,
            profiles: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.cfg
    }

    /// Scores `action` against its actor's profile and, when accepted, appends it.
    pub fn validate_action(&self, action: &ActionRecord, now: &DateTime<FixedOffset>) -> Verdict {
        let cfg = &self.cfg;
        let mut profile = self
            .profiles
            .entry(action.actor_id.clone())
            .or_insert_with(|| BehaviorProfile::new(action.actor_id.clone(), action.timestamp, cfg));

        let mut score = profile.behavior_score;
        if (cfg.unusual_hours_start..cfg.unusual_hours_end).contains(&now.hour()) {
            score *= cfg.unusual_hours_penalty;
        }
        if profile.action_count > cfg.diversity_min_actions
            && profile.distinct_recent_kinds() < cfg.diversity_min_kinds
        {
            score *= cfg.diversity_penalty;
        }
        let score = score.clamp(0.0, 1.0);
        profile.last_score = score;

        if score < cfg.min_behavior_score {
            warn!(
                actor = %action.actor_id,
                kind = %action.kind,
                score,
                "action rejected: behavior score below threshold"
            );
            return Verdict::Rejected(RejectReason::LowBehaviorScore { score });
        }

        let recent = profile.count_since(action.timestamp - cfg.burst_window_ms, None);
        if recent + 1 > cfg.burst_limit {
            warn!(
                actor = %action.actor_id,
                kind = %action.kind,
                recent,
                "action rejected: burst detected"
            );
            return Verdict::Rejected(RejectReason::BurstDetected {
                recent,
                window_ms: cfg.burst_window_ms,
            });
        }

        profile.push(action.clone(), cfg.window_size);
        debug!(actor = %action.actor_id, kind = %action.kind, score, "action accepted");
        Verdict::Accepted { score }
    }

    /// Checks a governance vote. Does not record anything; the caller records
    /// the accepted vote as a `governance_vote` action.
    pub fn validate_vote(&self, vote: &Vote) -> Verdict {
        let cfg = &self.cfg;
        let profile = self
            .profiles
            .entry(vote.actor_id.clone())
            .or_insert_with(|| BehaviorProfile::new(vote.actor_id.clone(), vote.timestamp, cfg));

        if vote.weight > profile.staking_balance {
            warn!(
                actor = %vote.actor_id,
                weight = vote.weight,
                staked = profile.staking_balance,
                "vote rejected: weight exceeds stake"
            );
            return Verdict::Rejected(RejectReason::VoteWeightExceedsStake {
                weight: vote.weight,
                staked: profile.staking_balance,
            });
        }

        let recent_votes =
            profile.count_since(vote.timestamp - cfg.vote_window_ms, Some(GOVERNANCE_VOTE));
        if recent_votes + 1 > cfg.vote_limit {
            warn!(actor = %vote.actor_id, recent_votes, "vote rejected: voting too fast");
            return Verdict::Rejected(RejectReason::VoteRateExceeded {
                recent_votes,
                window_ms: cfg.vote_window_ms,
            });
        }

        Verdict::Accepted {
            score: profile.last_score,
        }
    }

    pub fn adjust_staking_balance(&self, actor: &ActorId, delta: f64, now_ms: i64) -> f64 {
        let mut profile = self
            .profiles
            .entry(actor.clone())
            .or_insert_with(|| BehaviorProfile::new(actor.clone(), now_ms, &self.cfg));
        profile.staking_balance = (profile.staking_balance + delta).max(0.0);
        profile.staking_balance
    }

    /// Nudges reputation; returns the new value, or `None` for unknown actors.
    pub fn adjust_reputation(&self, actor: &ActorId, delta: f64) -> Option<f64> {
        let mut profile = self.profiles.get_mut(actor)?;
        profile.reputation_score = (profile.reputation_score + delta).clamp(0.0, 1.0);
        Some(profile.reputation_score)
    }

    pub fn profile(&self, actor: &ActorId) -> Option<BehaviorProfile> {
        self.profiles.get(actor).map(|p| p.value().clone())
    }

    /// Actors whose last evaluated score is below `threshold`.
    pub fn suspicious_actors(&self, threshold: f64) -> Vec<(ActorId, f64)> {
        let mut out: Vec<(ActorId, f64)> = self
            .profiles
            .iter()
            .filter(|p| p.last_score < threshold)
            .map(|p| (p.key().clone(), p.last_score))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }
}
