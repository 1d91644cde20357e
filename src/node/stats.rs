use serde::{Deserialize, Serialize};

use crate::types::Address;

/// Snapshot derived fresh on every read; never cached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub address: Address,
    /// Simulated; drawn from the configured peer range on each read.
    pub peer_count: u64,
    pub chain_length: usize,
    pub mempool_length: usize,
    pub mining_active: bool,
    pub difficulty: u32,
    pub blocks_mined: u64,
    /// Attempts per second of the last mined block.
    pub hash_rate: f64,
    pub action_rewards: f64,
    pub rewards_earned: f64,
    pub balance: f64,
    pub accepted_actions: u64,
    pub rejected_actions: u64,
    pub contracts: usize,
    pub nfts: usize,
    pub active_proposals: usize,
    pub staking_pools: usize,
    pub bridges: usize,
    pub timestamp: i64,
}

impl NetworkStats {
    /// Row pushed to the `nodes` table.
    pub fn to_row(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut row = serde_json::Map::new();
        row.insert("node_id".into(), self.address.as_str().into());
        row.insert("origin".into(), self.address.as_str().into());
        row.insert("peer_count".into(), self.peer_count.into());
        row.insert("chain_length".into(), (self.chain_length as u64).into());
        row.insert("mempool_length".into(), (self.mempool_length as u64).into());
        row.insert("mining_active".into(), self.mining_active.into());
        row.insert("difficulty".into(), self.difficulty.into());
        row.insert("blocks_mined".into(), self.blocks_mined.into());
        row.insert("hash_rate".into(), self.hash_rate.into());
        row.insert("balance".into(), self.balance.into());
        row.insert("action_rewards".into(), self.action_rewards.into());
        row.insert("status".into(), if self.mining_active { "mining" } else { "idle" }.into());
        row.insert("updated_at".into(), self.timestamp.into());
        row
    }
}
