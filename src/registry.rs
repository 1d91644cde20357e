//! In-memory entity registries. Each entity kind is its own typed value; ids
//! are synthetic `<prefix>_<timestamp>_<random>` strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Address, Metadata};

pub const CONTRACT_PREFIX: &str = "contract";
pub const NFT_PREFIX: &str = "nft";
pub const PROPOSAL_PREFIX: &str = "proposal";
pub const POOL_PREFIX: &str = "pool";
pub const BRIDGE_PREFIX: &str = "bridge";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Paused,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmartContract {
    pub address: String,
    pub owner: Address,
    pub code: String,
    pub contract_type: String,
    pub created_at: i64,
    pub status: ContractStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NftToken {
    pub token_id: String,
    pub owner: Address,
    pub creator: Address,
    pub metadata: Metadata,
    /// Fraction of secondary sales, e.g. `0.05`.
    pub royalty: f64,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub proposer: Address,
    pub title: String,
    pub description: String,
    pub created_at: i64,
    pub voting_period_ms: i64,
    pub votes_for: f64,
    pub votes_against: f64,
    pub voters: Vec<Address>,
}

impl Proposal {
    pub fn closes_at(&self) -> i64 {
        self.created_at.saturating_add(self.voting_period_ms)
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        now_ms <= self.closes_at()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StakingPool {
    pub id: String,
    pub name: String,
    pub owner: Address,
    pub apy: f64,
    pub min_stake: f64,
    pub total_staked: f64,
    pub stakes: BTreeMap<Address, f64>,
    pub created_at: i64,
}

impl StakingPool {
    pub fn staked_by(&self, who: &Address) -> f64 {
        self.stakes.get(who).copied().unwrap_or(0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Pending,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeConnection {
    pub id: String,
    pub owner: Address,
    pub source_chain: String,
    pub target_chain: String,
    pub asset: String,
    pub amount: f64,
    pub status: BridgeStatus,
    pub created_at: i64,
}

/// Tagged view over any registry entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum Entity {
    SmartContract(SmartContract),
    Nft(NftToken),
    Proposal(Proposal),
    StakingPool(StakingPool),
    Bridge(BridgeConnection),
}

#[derive(Clone, Debug, Default)]
pub struct Registries {
    pub contracts: BTreeMap<String, SmartContract>,
    pub nfts: BTreeMap<String, NftToken>,
    pub proposals: BTreeMap<String, Proposal>,
    pub pools: BTreeMap<String, StakingPool>,
    pub bridges: BTreeMap<String, BridgeConnection>,
}

impl Registries {
    pub fn active_proposals(&self, now_ms: i64) -> usize {
        self.proposals.values().filter(|p| p.is_active(now_ms)).count()
    }

    pub fn lookup(&self, id: &str) -> Option<Entity> {
        let prefix = id.split('_').next().unwrap_or_default();
        match prefix {
            CONTRACT_PREFIX => self.contracts.get(id).cloned().map(Entity::SmartContract),
            NFT_PREFIX => self.nfts.get(id).cloned().map(Entity::Nft),
            PROPOSAL_PREFIX => self.proposals.get(id).cloned().map(Entity::Proposal),
            POOL_PREFIX => self.pools.get(id).cloned().map(Entity::StakingPool),
            BRIDGE_PREFIX => self.bridges.get(id).cloned().map(Entity::Bridge),
            _ => None,
        }
    }
}
