//! Action reward table and multiplier policy.
//!
//! Rewards are `base(kind) * multiplier`, where the multiplier is the product
//! of independent sub-rules. The table and policy are pure; the random bonus
//! is applied by the node at its own call site.

use chrono::{DateTime, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::random::RandomSource;
use crate::types::{ActionKind, Metadata};

/// Metadata key carrying a 0..100 engagement score.
pub const ENGAGEMENT_SCORE_KEY: &str = "engagementScore";

const BUILTIN_REWARDS: &[(&str, f64)] = &[
    ("button_click", 0.25),
    ("page_visit", 0.5),
    ("time_spent", 0.75),
    ("form_submit", 1.0),
    ("social_share", 2.0),
    ("transaction", 2.5),
    ("content_creation", 3.0),
    ("governance_vote", 3.0),
    ("staking", 4.0),
    ("nft_mint", 5.0),
    ("referral", 5.0),
    ("liquidity_provided", 6.0),
    ("proposal_create", 8.0),
    ("cross_chain_bridge", 8.0),
    ("smart_contract_deploy", 10.0),
];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RewardConfig {
    #[serde(default = "default_reward")]
    pub default_reward: f64,
    #[serde(default = "default_business_start")]
    pub business_hours_start: u32,
    #[serde(default = "default_business_end")]
    pub business_hours_end: u32,
    #[serde(default = "default_business_bonus")]
    pub business_hours_bonus: f64,
    /// Upper bound of the random bonus; the factor is drawn from `[1, 1 + max)`.
    #[serde(default = "default_random_bonus_max")]
    pub random_bonus_max: f64,
    /// Per-kind base reward overrides layered over the built-in table.
    #[serde(default)]
    pub overrides: BTreeMap<String, f64>,
}

const fn default_reward() -> f64 {
    0.1
}

const fn default_business_start() -> u32 {
    9
}

const fn default_business_end() -> u32 {
    17
}

const fn default_business_bonus() -> f64 {
    1.2
}

const fn default_random_bonus_max() -> f64 {
    0.5
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            default_reward: default_reward(),
            business_hours_start: default_business_start(),
            business_hours_end: default_business_end(),
            business_hours_bonus: default_business_bonus(),
            random_bonus_max: default_random_bonus_max(),
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RewardTable {
    base: BTreeMap<String, f64>,
    default_reward: f64,
}

impl RewardTable {
    pub fn from_config(cfg: &RewardConfig) -> Self {
        let mut base: BTreeMap<String, f64> = BUILTIN_REWARDS
            .iter()
            .map(|(kind, value)| ((*kind).to_owned(), *value))
            .collect();
        for (kind, value) in &cfg.overrides {
            base.insert(kind.clone(), *value);
        }
        Self {
            base,
            default_reward: cfg.default_reward,
        }
    }

    /// Base reward for `kind`; unknown kinds degrade to the default.
    pub fn reward(&self, kind: &ActionKind) -> f64 {
        self.base
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_reward)
    }

    pub fn kinds(&self) -> impl Iterator<Item = (&str, f64)> {
        self.base.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for RewardTable {
    fn default() -> Self {
        Self::from_config(&RewardConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct MultiplierPolicy {
    business_hours: (u32, u32),
    business_hours_bonus: f64,
    random_bonus_max: f64,
}

impl MultiplierPolicy {
    pub fn from_config(cfg: &RewardConfig) -> Self {
        Self {
            business_hours: (cfg.business_hours_start, cfg.business_hours_end),
            business_hours_bonus: cfg.business_hours_bonus,
            random_bonus_max: cfg.random_bonus_max,
        }
    }

    pub fn time_of_day_factor(&self, now: &DateTime<FixedOffset>) -> f64 {
        let (start, end) = self.business_hours;
        if (start..end).contains(&now.hour()) {
            self.business_hours_bonus
        } else {
            1.0
        }
    }

    pub fn engagement_factor(&self, metadata: &Metadata) -> f64 {
        metadata
            .get(ENGAGEMENT_SCORE_KEY)
            .and_then(|v| v.as_f64())
            .map(|score| 1.0 + score / 100.0)
            .unwrap_or(1.0)
    }

    /// Deterministic part of the multiplier: time-of-day × engagement.
    pub fn multiplier(&self, now: &DateTime<FixedOffset>, metadata: &Metadata) -> f64 {
        self.time_of_day_factor(now) * self.engagement_factor(metadata)
    }

    /// Variance factor in `[1.0, 1.0 + random_bonus_max)`.
    pub fn random_bonus(&self, random: &dyn RandomSource) -> f64 {
        random.range_f64(1.0, 1.0 + self.random_bonus_max)
    }
}

impl Default for MultiplierPolicy {
    fn default() -> Self {
        Self::from_config(&RewardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::random::{PinnedRandom, SeededRandom};
    use serde_json::json;

    #[test]
    fn unknown_kind_degrades_to_default() {
        let table = RewardTable::default();
        assert_eq!(table.reward(&ActionKind::from("definitely_not_a_kind")), 0.1);
    }

    #[test]
    fn documented_ordering_holds() {
        let table = RewardTable::default();
        let ordered = [
            "page_visit",
            "form_submit",
            "social_share",
            "liquidity_provided",
            "cross_chain_bridge",
        ];
        for pair in ordered.windows(2) {
            assert!(
                table.reward(&ActionKind::from(pair[0])) < table.reward(&ActionKind::from(pair[1])),
                "{} should pay less than {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn overrides_replace_builtin_values() {
        let mut cfg = RewardConfig::default();
        cfg.overrides.insert("page_visit".into(), 0.9);
        cfg.overrides.insert("custom_kind".into(), 4.2);
        let table = RewardTable::from_config(&cfg);
        assert_eq!(table.reward(&ActionKind::from("page_visit")), 0.9);
        assert_eq!(table.reward(&ActionKind::from("custom_kind")), 4.2);
    }

    #[test]
    fn business_hours_bonus_applies_inside_window_only() {
        let policy = MultiplierPolicy::default();
        let inside = ManualClock::at_hour(10).now();
        let outside = ManualClock::at_hour(20).now();
        let empty = Metadata::new();
        assert_eq!(policy.multiplier(&inside, &empty), 1.2);
        assert_eq!(policy.multiplier(&outside, &empty), 1.0);
    }

    #[test]
    fn engagement_and_time_compose_by_multiplication() {
        let policy = MultiplierPolicy::default();
        let now = ManualClock::at_hour(10).now();
        let mut meta = Metadata::new();
        meta.insert(ENGAGEMENT_SCORE_KEY.into(), json!(50));
        let m = policy.multiplier(&now, &meta);
        assert!((m - 1.2 * 1.5).abs() < 1e-9);
    }

    #[test]
    fn random_bonus_bounds() {
        let policy = MultiplierPolicy::default();
        assert_eq!(policy.random_bonus(&PinnedRandom::zero()), 1.0);
        let random = SeededRandom::new(11);
        for _ in 0..500 {
            let b = policy.random_bonus(&random);
            assert!((1.0..1.5).contains(&b));
        }
    }
}
