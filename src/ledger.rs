//! Simulated ledger: synthetic transactions, the mempool, and the append-only
//! block list.
//!
//! Hashing is 64-bit FNV-1a rendered as 16 lowercase hex characters. It is a
//! pacing device for the simulated proof-of-work, not a security primitive.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

use crate::types::Address;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Streaming FNV-1a state. Cloning a partially fed state lets the miner hash
/// the fixed block prefix once and vary only the nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fnv1a(u64);

impl Fnv1a {
    pub fn new() -> Self {
        Self(FNV_OFFSET_BASIS)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn finish(&self) -> u64 {
        self.0
    }

    pub fn hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `hash` starts with `difficulty` zero characters.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let d = difficulty as usize;
    hash.len() >= d && hash.bytes().take(d).all(|b| b == b'0')
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Transfer,
    Reward,
    Burn,
    Stake,
    Unstake,
    Bridge,
    Trade,
    NftMint,
    ContractDeploy,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Transfer => "transfer",
            TxKind::Reward => "reward",
            TxKind::Burn => "burn",
            TxKind::Stake => "stake",
            TxKind::Unstake => "unstake",
            TxKind::Bridge => "bridge",
            TxKind::Trade => "trade",
            TxKind::NftMint => "nft_mint",
            TxKind::ContractDeploy => "contract_deploy",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: Address,
    pub to: Address,
    pub amount: f64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub kind: TxKind,
    pub status: TxStatus,
}

impl Transaction {
    /// Builds a pending transaction; `salt` keeps otherwise identical
    /// transactions from colliding.
    pub fn pending(from: Address, to: Address, amount: f64, kind: TxKind, timestamp: i64, salt: &str) -> Self {
        let mut h = Fnv1a::new();
        h.write(from.as_str().as_bytes());
        h.write(b"|");
        h.write(to.as_str().as_bytes());
        h.write(b"|");
        h.write(&amount.to_bits().to_le_bytes());
        h.write(&timestamp.to_le_bytes());
        h.write(kind.as_str().as_bytes());
        h.write(salt.as_bytes());
        Self {
            hash: format!("0x{}", h.hex()),
            from,
            to,
            amount,
            timestamp,
            kind,
            status: TxStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub hash: String,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub timestamp: i64,
    pub nonce: u64,
    pub difficulty: u32,
}

/// Hash state over the parts of a block that stay fixed while mining.
pub fn block_prefix(
    transactions: &[Transaction],
    previous_hash: &str,
    timestamp: i64,
) -> Result<Fnv1a, serde_json::Error> {
    let mut h = Fnv1a::new();
    h.write(&serde_json::to_vec(transactions)?);
    h.write(previous_hash.as_bytes());
    h.write(&timestamp.to_le_bytes());
    Ok(h)
}

pub fn seal(prefix: &Fnv1a, nonce: u64) -> String {
    let mut h = *prefix;
    h.write(&nonce.to_le_bytes());
    h.hex()
}

impl Block {
    pub fn genesis() -> Self {
        Self {
            index: 0,
            hash: "0".repeat(16),
            previous_hash: String::new(),
            transactions: Vec::new(),
            timestamp: 0,
            nonce: 0,
            difficulty: 0,
        }
    }

    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let prefix = block_prefix(&self.transactions, &self.previous_hash, self.timestamp)?;
        Ok(seal(&prefix, self.nonce))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("block {index} links to {got}, expected tip {expected}")]
    StaleParent { index: u64, expected: String, got: String },
    #[error("block hash {hash} does not satisfy difficulty {difficulty}")]
    Difficulty { hash: String, difficulty: u32 },
    #[error("block hash mismatch: claimed {claimed}, computed {computed}")]
    HashMismatch { claimed: String, computed: String },
    #[error("block payload could not be hashed: {0}")]
    Encoding(String),
}

/// Append-only chain, always starting at [`Block::genesis`].
#[derive(Clone, Debug)]
pub struct Ledger {
    blocks: Vec<Block>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::genesis()],
        }
    }

    pub fn tip(&self) -> &Block {
        // never empty: genesis is pushed in `new`
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn blocks_since(&self, index: u64) -> &[Block] {
        let start = (index as usize).min(self.blocks.len());
        &self.blocks[start..]
    }

    /// Appends a sealed block after checking linkage, proof and hash.
    pub fn append(&mut self, block: Block) -> Result<&Block, LedgerError> {
        let tip = self.tip();
        if block.previous_hash != tip.hash || block.index != tip.index + 1 {
            return Err(LedgerError::StaleParent {
                index: block.index,
                expected: tip.hash.clone(),
                got: block.previous_hash.clone(),
            });
        }
        if !meets_difficulty(&block.hash, block.difficulty) {
            return Err(LedgerError::Difficulty {
                hash: block.hash.clone(),
                difficulty: block.difficulty,
            });
        }
        let computed = block
            .compute_hash()
            .map_err(|e| LedgerError::Encoding(e.to_string()))?;
        if computed != block.hash {
            return Err(LedgerError::HashMismatch {
                claimed: block.hash.clone(),
                computed,
            });
        }
        self.blocks.push(block);
        Ok(self.tip())
    }

    /// Sum of confirmed amounts addressed to `address`.
    pub fn inbound_total(&self, address: &Address) -> f64 {
        self.blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .filter(|tx| &tx.to == address)
            .map(|tx| tx.amount)
            .sum()
    }

    pub fn contains_tx(&self, hash: &str) -> bool {
        self.blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .any(|tx| tx.hash == hash)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO queue of pending transactions.
#[derive(Clone, Debug, Default)]
pub struct Mempool {
    queue: VecDeque<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tx: Transaction) {
        self.queue.push_back(tx);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.queue.iter().any(|tx| tx.hash == hash)
    }

    /// Copies up to `max` transactions from the front without removing them.
    pub fn peek_prefix(&self, max: usize) -> Vec<Transaction> {
        self.queue.iter().take(max).cloned().collect()
    }

    /// Removes every listed hash. Returns `false` (and removes nothing) if
    /// any of them is no longer pending.
    pub fn consume(&mut self, hashes: &[&str]) -> bool {
        if !hashes.iter().all(|h| self.contains(h)) {
            return false;
        }
        let wanted: HashSet<&str> = hashes.iter().copied().collect();
        self.queue.retain(|tx| !wanted.contains(tx.hash.as_str()));
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.queue.iter()
    }
}
