//! Node façade: the only owner of the ledger, mempool and registries.
//!
//! Every privileged operation (deploy, mint, propose, bridge, stake, vote) is
//! itself a rewarded action recorded through the consensus heuristic with a
//! per-operation weight. State lives behind one `parking_lot::Mutex` that is
//! never held across an `.await` or while listeners run.

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink, NoopAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::{MiningSection, NodeSection, SimConfig};
use crate::consensus::{ActionRecord, ConsensusHeuristic, RejectReason, Verdict, Vote, GOVERNANCE_VOTE};
use crate::events::{EventBus, NodeEvent};
use crate::ledger::{Block, Ledger, Mempool, Transaction, TxKind};
use crate::random::{RandomSource, ThreadRandom};
use crate::registry::{
    BridgeConnection, BridgeStatus, ContractStatus, Entity, NftToken, Proposal, Registries, SmartContract,
    StakingPool, BRIDGE_PREFIX, CONTRACT_PREFIX, NFT_PREFIX, POOL_PREFIX, PROPOSAL_PREFIX,
};
use crate::rewards::{MultiplierPolicy, RewardTable};
use crate::telemetry::TelemetryHandle;
use crate::types::{synthetic_id, ActionKind, ActorId, Address, Metadata};
use crate::worker::{MiningWorker, WorkerCommand, WorkerConfig, WorkerHandle};

mod mining;
pub mod stats;

pub use mining::COINBASE;
pub use stats::NetworkStats;

/// Metadata key naming the acting user; the node address is used otherwise.
pub const ACTOR_ID_KEY: &str = "actor_id";

/// Reward weights applied to privileged operations.
pub mod weights {
    pub const CONTRACT_DEPLOY: f64 = 2.0;
    pub const NFT_MINT: f64 = 2.5;
    pub const PROPOSAL_CREATE: f64 = 1.5;
    pub const GOVERNANCE_VOTE: f64 = 1.5;
    pub const BRIDGE: f64 = 4.0;
    pub const STAKING: f64 = 1.5;
}

mod kinds {
    pub const SMART_CONTRACT_DEPLOY: &str = "smart_contract_deploy";
    pub const NFT_MINT: &str = "nft_mint";
    pub const PROPOSAL_CREATE: &str = "proposal_create";
    pub const CROSS_CHAIN_BRIDGE: &str = "cross_chain_bridge";
    pub const STAKING: &str = "staking";
}

#[derive(Debug, Error, PartialEq)]
pub enum NodeError {
    #[error("invalid amount {0}")]
    InvalidAmount(f64),
    #[error("transaction needs a counterparty address")]
    MissingParty,
    #[error("insufficient balance: needed {needed}, available {available}")]
    InsufficientBalance { needed: f64, available: f64 },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("proposal {0} is closed for voting")]
    ProposalClosed(String),
    #[error("no tokio runtime available to run the miner")]
    NoRuntime,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardOutcome {
    pub accepted: bool,
    pub kind: ActionKind,
    pub reward: f64,
    pub multiplier: f64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub accepted: bool,
    pub verdict: Verdict,
    pub votes_for: f64,
    pub votes_against: f64,
    /// Reward for the governance action recorded with an accepted vote.
    pub reward: f64,
}

/// Injected collaborators. The session builds one of these per node.
#[derive(Clone)]
pub struct NodeDeps {
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub events: Arc<EventBus>,
    pub telemetry: TelemetryHandle,
    pub audit: Arc<dyn AuditSink>,
}

impl Default for NodeDeps {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            random: Arc::new(ThreadRandom),
            events: Arc::new(EventBus::new()),
            telemetry: TelemetryHandle::default(),
            audit: Arc::new(NoopAuditSink),
        }
    }
}

#[derive(Default)]
struct NodeState {
    ledger: Ledger,
    mempool: Mempool,
    registries: Registries,
    /// Action rewards net of spends; half of the balance formula.
    action_rewards: f64,
    /// Gross action rewards ever credited.
    rewards_earned: f64,
    blocks_mined: u64,
    hash_rate: f64,
    accepted_actions: u64,
    rejected_actions: u64,
}

impl NodeState {
    fn balance(&self, address: &Address) -> f64 {
        self.ledger.inbound_total(address) + self.action_rewards
    }

    fn debit(&mut self, address: &Address, amount: f64) -> Result<f64, NodeError> {
        let available = self.balance(address);
        if amount > available {
            return Err(NodeError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        self.action_rewards -= amount;
        Ok(available - amount)
    }
}

#[derive(Default)]
struct MiningControl {
    worker: Option<WorkerHandle>,
    driver: Option<JoinHandle<()>>,
}

struct NodeInner {
    address: Address,
    node_cfg: NodeSection,
    mining_cfg: MiningSection,
    rewards: RewardTable,
    multiplier: MultiplierPolicy,
    consensus: ConsensusHeuristic,
    deps: NodeDeps,
    state: Mutex<NodeState>,
    mining: Mutex<MiningControl>,
    mining_active: AtomicBool,
    mining_session: AtomicU64,
    mempool_signal: Notify,
    /// Held from vote validation until the vote is counted.
    vote_gate: Mutex<()>,
}

/// Cheap-to-clone handle; all clones share one node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

fn check_amount(amount: f64) -> Result<(), NodeError> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(NodeError::InvalidAmount(amount))
    }
}

impl Node {
    pub fn new(cfg: &SimConfig, deps: NodeDeps) -> Self {
        let address = match cfg.node.address.as_deref().map(str::trim) {
            Some(a) if !a.is_empty() => Address::from(a),
            _ => Address(synthetic_id("node", deps.clock.now_ms(), deps.random.as_ref())),
        };
        info!(%address, difficulty = cfg.mining.difficulty, "node created");
        Self {
            inner: Arc::new(NodeInner {
                address,
                node_cfg: cfg.node.clone(),
                mining_cfg: cfg.mining.clone(),
                rewards: RewardTable::from_config(&cfg.rewards),
                multiplier: MultiplierPolicy::from_config(&cfg.rewards),
                consensus: ConsensusHeuristic::new(cfg.consensus.clone()),
                deps,
                state: Mutex::new(NodeState::default()),
                mining: Mutex::new(MiningControl::default()),
                mining_active: AtomicBool::new(false),
                mining_session: AtomicU64::new(0),
                mempool_signal: Notify::new(),
                vote_gate: Mutex::new(()),
            }),
        }
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn consensus(&self) -> &ConsensusHeuristic {
        &self.inner.consensus
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.deps.events
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.inner.deps.telemetry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.deps.clock
    }

    pub fn random(&self) -> &Arc<dyn RandomSource> {
        &self.inner.deps.random
    }

    pub fn reward_table(&self) -> &RewardTable {
        &self.inner.rewards
    }

    fn now(&self) -> DateTime<FixedOffset> {
        self.inner.deps.clock.now()
    }

    fn new_id(&self, prefix: &str, now_ms: i64) -> String {
        synthetic_id(prefix, now_ms, self.inner.deps.random.as_ref())
    }

    fn emit(&self, event: NodeEvent) {
        self.inner.deps.events.emit(&event);
    }

    fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.inner.deps.audit.emit(event) {
            warn!(error = %e, "audit sink rejected event");
        }
    }

    fn emit_balance(&self, balance: f64, delta: f64, reason: &str) {
        self.emit(NodeEvent::BalanceUpdate {
            address: self.inner.address.clone(),
            balance,
            delta,
            reason: reason.to_owned(),
        });
    }

    // ---- actions ---------------------------------------------------------

    /// Records a user interaction and credits its reward when the heuristic accepts it.
    pub fn record_action(&self, kind: impl Into<ActionKind>, metadata: Metadata) -> RewardOutcome {
        self.record_weighted(kind.into(), metadata, 1.0)
    }

    fn record_weighted(&self, kind: ActionKind, metadata: Metadata, weight: f64) -> RewardOutcome {
        let now = self.now();
        let timestamp = now.timestamp_millis();
        let actor = metadata
            .get(ACTOR_ID_KEY)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(|s| ActorId(s.to_owned()))
            .unwrap_or_else(|| ActorId::from(&self.inner.address));

        let multiplier = self.inner.multiplier.multiplier(&now, &metadata)
            * self.inner.multiplier.random_bonus(self.inner.deps.random.as_ref())
            * weight;
        let record = ActionRecord {
            kind: kind.clone(),
            timestamp,
            actor_id: actor,
            metadata,
            reward_multiplier: multiplier,
        };

        match self.inner.consensus.validate_action(&record, &now) {
            Verdict::Rejected(reason) => {
                self.inner.state.lock().rejected_actions += 1;
                self.telemetry().incr("actions.rejected");
                self.audit(AuditEvent::rejected(record, reason.clone()));
                RewardOutcome {
                    accepted: false,
                    kind,
                    reward: 0.0,
                    multiplier,
                    timestamp,
                    reason: Some(reason),
                }
            }
            Verdict::Accepted { .. } => {
                let reward = self.inner.rewards.reward(&kind) * multiplier;
                let balance = {
                    let mut state = self.inner.state.lock();
                    state.action_rewards += reward;
                    state.rewards_earned += reward;
                    state.accepted_actions += 1;
                    state.balance(&self.inner.address)
                };
                debug!(kind = %kind, reward, multiplier, "action rewarded");
                self.telemetry().incr("actions.accepted");
                self.audit(AuditEvent::action(record, reward));
                self.emit_balance(balance, reward, kind.as_str());
                RewardOutcome {
                    accepted: true,
                    kind,
                    reward,
                    multiplier,
                    timestamp,
                    reason: None,
                }
            }
        }
    }

    // ---- transactions ----------------------------------------------------

    /// Queues a pending transaction from this node. No balance check.
    pub fn create_transaction(&self, to: Address, amount: f64, kind: TxKind) -> Result<Transaction, NodeError> {
        if to.is_empty() {
            return Err(NodeError::MissingParty);
        }
        check_amount(amount)?;
        let tx = self.build_tx(self.inner.address.clone(), to, amount, kind);
        self.enqueue(tx.clone());
        Ok(tx)
    }

    fn build_tx(&self, from: Address, to: Address, amount: f64, kind: TxKind) -> Transaction {
        let salt = self.inner.deps.random.token(8);
        Transaction::pending(from, to, amount, kind, self.inner.deps.clock.now_ms(), &salt)
    }

    fn enqueue(&self, tx: Transaction) {
        debug!(hash = %tx.hash, kind = tx.kind.as_str(), amount = tx.amount, "transaction queued");
        self.inner.state.lock().mempool.push(tx);
        self.inner.mempool_signal.notify_one();
    }

    /// Debits the balance and queues a `transfer` to `to`.
    pub fn transfer(&self, to: Address, amount: f64) -> Result<Transaction, NodeError> {
        if to.is_empty() {
            return Err(NodeError::MissingParty);
        }
        check_amount(amount)?;
        let tx = self.build_tx(self.inner.address.clone(), to, amount, TxKind::Transfer);
        let balance = {
            let mut state = self.inner.state.lock();
            let balance = state.debit(&self.inner.address, amount)?;
            state.mempool.push(tx.clone());
            balance
        };
        self.inner.mempool_signal.notify_one();
        info!(to = %tx.to, amount, "transfer queued");
        self.emit_balance(balance, -amount, "transfer");
        Ok(tx)
    }

    pub fn burn_tokens(&self, amount: f64) -> Result<Transaction, NodeError> {
        check_amount(amount)?;
        let burn = Address(self.inner.node_cfg.burn_address.clone());
        let tx = self.build_tx(self.inner.address.clone(), burn, amount, TxKind::Burn);
        let balance = {
            let mut state = self.inner.state.lock();
            let balance = state.debit(&self.inner.address, amount)?;
            state.mempool.push(tx.clone());
            balance
        };
        self.inner.mempool_signal.notify_one();
        info!(amount, "tokens burned");
        self.emit_balance(balance, -amount, "burn");
        Ok(tx)
    }

    // ---- registries ------------------------------------------------------

    pub fn deploy_smart_contract(&self, code: &str, contract_type: &str) -> String {
        let now_ms = self.inner.deps.clock.now_ms();
        let address = self.new_id(CONTRACT_PREFIX, now_ms);
        let contract = SmartContract {
            address: address.clone(),
            owner: self.inner.address.clone(),
            code: code.to_owned(),
            contract_type: contract_type.to_owned(),
            created_at: now_ms,
            status: ContractStatus::Active,
        };
        self.inner.state.lock().registries.contracts.insert(address.clone(), contract);
        info!(%address, contract_type, "smart contract deployed");
        self.record_weighted(
            ActionKind::from(kinds::SMART_CONTRACT_DEPLOY),
            operation_metadata("contract_address", &address),
            weights::CONTRACT_DEPLOY,
        );
        address
    }

    pub fn mint_nft(&self, metadata: Metadata, royalty: f64) -> String {
        let now_ms = self.inner.deps.clock.now_ms();
        let token_id = self.new_id(NFT_PREFIX, now_ms);
        let token = NftToken {
            token_id: token_id.clone(),
            owner: self.inner.address.clone(),
            creator: self.inner.address.clone(),
            metadata,
            royalty,
            created_at: now_ms,
        };
        self.inner.state.lock().registries.nfts.insert(token_id.clone(), token);
        info!(%token_id, royalty, "nft minted");
        self.record_weighted(
            ActionKind::from(kinds::NFT_MINT),
            operation_metadata("token_id", &token_id),
            weights::NFT_MINT,
        );
        token_id
    }

    /// `voting_period_ms` is the window after creation during which votes count.
    pub fn create_governance_proposal(&self, title: &str, description: &str, voting_period_ms: i64) -> String {
        let now_ms = self.inner.deps.clock.now_ms();
        let id = self.new_id(PROPOSAL_PREFIX, now_ms);
        let proposal = Proposal {
            id: id.clone(),
            proposer: self.inner.address.clone(),
            title: title.to_owned(),
            description: description.to_owned(),
            created_at: now_ms,
            voting_period_ms: voting_period_ms.max(0),
            votes_for: 0.0,
            votes_against: 0.0,
            voters: Vec::new(),
        };
        self.inner.state.lock().registries.proposals.insert(id.clone(), proposal);
        info!(proposal = %id, title, "governance proposal created");
        self.record_weighted(
            ActionKind::from(kinds::PROPOSAL_CREATE),
            operation_metadata("proposal_id", &id),
            weights::PROPOSAL_CREATE,
        );
        id
    }

    pub fn bridge_assets(&self, target_chain: &str, amount: f64, asset: &str) -> String {
        let now_ms = self.inner.deps.clock.now_ms();
        let id = self.new_id(BRIDGE_PREFIX, now_ms);
        let bridge = BridgeConnection {
            id: id.clone(),
            owner: self.inner.address.clone(),
            source_chain: "bitnun".into(),
            target_chain: target_chain.to_owned(),
            asset: asset.to_owned(),
            amount,
            status: BridgeStatus::Pending,
            created_at: now_ms,
        };
        self.inner.state.lock().registries.bridges.insert(id.clone(), bridge);
        info!(bridge = %id, target_chain, amount, asset, "bridge transfer opened");
        self.record_weighted(
            ActionKind::from(kinds::CROSS_CHAIN_BRIDGE),
            operation_metadata("bridge_id", &id),
            weights::BRIDGE,
        );
        id
    }

    pub fn complete_bridge(&self, bridge_id: &str) -> Result<BridgeConnection, NodeError> {
        let mut state = self.inner.state.lock();
        let bridge = state
            .registries
            .bridges
            .get_mut(bridge_id)
            .ok_or_else(|| NodeError::NotFound {
                kind: "bridge",
                id: bridge_id.to_owned(),
            })?;
        bridge.status = BridgeStatus::Completed;
        Ok(bridge.clone())
    }

    pub fn create_staking_pool(&self, name: &str, apy: f64, min_stake: f64) -> String {
        let now_ms = self.inner.deps.clock.now_ms();
        let id = self.new_id(POOL_PREFIX, now_ms);
        let pool = StakingPool {
            id: id.clone(),
            name: name.to_owned(),
            owner: self.inner.address.clone(),
            apy,
            min_stake: min_stake.max(0.0),
            total_staked: 0.0,
            stakes: Default::default(),
            created_at: now_ms,
        };
        self.inner.state.lock().registries.pools.insert(id.clone(), pool);
        info!(pool = %id, name, apy, "staking pool created");
        id
    }

    /// Moves `amount` from the balance into a pool and raises vote weight by the same.
    pub fn stake(&self, pool_id: &str, amount: f64) -> Result<RewardOutcome, NodeError> {
        check_amount(amount)?;
        let address = self.inner.address.clone();
        let tx = self.build_tx(address.clone(), Address(pool_id.to_owned()), amount, TxKind::Stake);
        let balance = {
            let mut state = self.inner.state.lock();
            let min_stake = state
                .registries
                .pools
                .get(pool_id)
                .map(|p| p.min_stake)
                .ok_or_else(|| NodeError::NotFound {
                    kind: "staking pool",
                    id: pool_id.to_owned(),
                })?;
            if amount < min_stake {
                return Err(NodeError::InvalidAmount(amount));
            }
            let balance = state.debit(&address, amount)?;
            if let Some(pool) = state.registries.pools.get_mut(pool_id) {
                pool.total_staked += amount;
                *pool.stakes.entry(address.clone()).or_insert(0.0) += amount;
            }
            state.mempool.push(tx);
            balance
        };
        self.inner.mempool_signal.notify_one();
        let staked = self.inner.consensus.adjust_staking_balance(
            &ActorId::from(&address),
            amount,
            self.inner.deps.clock.now_ms(),
        );
        info!(pool = pool_id, amount, staked, "stake placed");
        self.emit_balance(balance, -amount, "stake");
        Ok(self.record_weighted(
            ActionKind::from(kinds::STAKING),
            operation_metadata("pool_id", pool_id),
            weights::STAKING,
        ))
    }

    /// Withdraws stake; the amount returns as an `unstake` transaction from the
    /// pool and counts toward the balance once confirmed.
    pub fn unstake(&self, pool_id: &str, amount: f64) -> Result<Transaction, NodeError> {
        check_amount(amount)?;
        let address = self.inner.address.clone();
        let tx = self.build_tx(Address(pool_id.to_owned()), address.clone(), amount, TxKind::Unstake);
        {
            let mut state = self.inner.state.lock();
            let pool = state
                .registries
                .pools
                .get_mut(pool_id)
                .ok_or_else(|| NodeError::NotFound {
                    kind: "staking pool",
                    id: pool_id.to_owned(),
                })?;
            let staked = pool.staked_by(&address);
            if amount > staked {
                return Err(NodeError::InsufficientBalance {
                    needed: amount,
                    available: staked,
                });
            }
            pool.total_staked -= amount;
            if staked - amount <= f64::EPSILON {
                pool.stakes.remove(&address);
            } else {
                pool.stakes.insert(address.clone(), staked - amount);
            }
            state.mempool.push(tx.clone());
        }
        self.inner.mempool_signal.notify_one();
        self.inner.consensus.adjust_staking_balance(
            &ActorId::from(&address),
            -amount,
            self.inner.deps.clock.now_ms(),
        );
        info!(pool = pool_id, amount, "stake withdrawn");
        Ok(tx)
    }

    pub fn vote_on_proposal(&self, proposal_id: &str, support: bool, weight: f64) -> Result<VoteOutcome, NodeError> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(NodeError::InvalidAmount(weight));
        }
        let now_ms = self.inner.deps.clock.now_ms();
        {
            let state = self.inner.state.lock();
            let proposal = state
                .registries
                .proposals
                .get(proposal_id)
                .ok_or_else(|| NodeError::NotFound {
                    kind: "proposal",
                    id: proposal_id.to_owned(),
                })?;
            if !proposal.is_active(now_ms) {
                return Err(NodeError::ProposalClosed(proposal_id.to_owned()));
            }
        }

        let _gate = self.inner.vote_gate.lock();
        let vote = Vote {
            actor_id: ActorId::from(&self.inner.address),
            proposal_id: proposal_id.to_owned(),
            support,
            weight,
            timestamp: now_ms,
        };
        let mut verdict = self.inner.consensus.validate_vote(&vote);
        let mut reward = 0.0;
        if verdict.is_accepted() {
            // the vote only counts once it is in the actor's window
            let outcome = self.record_weighted(
                ActionKind::from(GOVERNANCE_VOTE),
                operation_metadata("proposal_id", proposal_id),
                weights::GOVERNANCE_VOTE,
            );
            match outcome.reason {
                Some(reason) if !outcome.accepted => verdict = Verdict::Rejected(reason),
                _ => reward = outcome.reward,
            }
        }
        if !verdict.is_accepted() {
            let state = self.inner.state.lock();
            let (votes_for, votes_against) = state
                .registries
                .proposals
                .get(proposal_id)
                .map(|p| (p.votes_for, p.votes_against))
                .unwrap_or_default();
            return Ok(VoteOutcome {
                accepted: false,
                verdict,
                votes_for,
                votes_against,
                reward: 0.0,
            });
        }

        let (votes_for, votes_against) = {
            let mut state = self.inner.state.lock();
            let proposal = state
                .registries
                .proposals
                .get_mut(proposal_id)
                .ok_or_else(|| NodeError::NotFound {
                    kind: "proposal",
                    id: proposal_id.to_owned(),
                })?;
            if support {
                proposal.votes_for += weight;
            } else {
                proposal.votes_against += weight;
            }
            if !proposal.voters.contains(&self.inner.address) {
                proposal.voters.push(self.inner.address.clone());
            }
            (proposal.votes_for, proposal.votes_against)
        };
        info!(proposal = proposal_id, support, weight, "vote counted");
        Ok(VoteOutcome {
            accepted: true,
            verdict,
            votes_for,
            votes_against,
            reward,
        })
    }

    // ---- reads -----------------------------------------------------------

    pub fn get_balance(&self) -> f64 {
        self.inner.state.lock().balance(&self.inner.address)
    }

    pub fn get_network_stats(&self) -> NetworkStats {
        let now_ms = self.inner.deps.clock.now_ms();
        let peer_count = self
            .inner
            .deps
            .random
            .range_u64(self.inner.node_cfg.min_peers, self.inner.node_cfg.max_peers.saturating_add(1));
        let state = self.inner.state.lock();
        NetworkStats {
            address: self.inner.address.clone(),
            peer_count,
            chain_length: state.ledger.len(),
            mempool_length: state.mempool.len(),
            mining_active: self.is_mining(),
            difficulty: self.inner.mining_cfg.difficulty,
            blocks_mined: state.blocks_mined,
            hash_rate: state.hash_rate,
            action_rewards: state.action_rewards,
            rewards_earned: state.rewards_earned,
            balance: state.balance(&self.inner.address),
            accepted_actions: state.accepted_actions,
            rejected_actions: state.rejected_actions,
            contracts: state.registries.contracts.len(),
            nfts: state.registries.nfts.len(),
            active_proposals: state.registries.active_proposals(now_ms),
            staking_pools: state.registries.pools.len(),
            bridges: state.registries.bridges.len(),
            timestamp: now_ms,
        }
    }

    /// Confirmed amount addressed to this node.
    pub fn inbound_total(&self) -> f64 {
        self.inner.state.lock().ledger.inbound_total(&self.inner.address)
    }

    /// Action-reward tally net of spends.
    pub fn action_rewards(&self) -> f64 {
        self.inner.state.lock().action_rewards
    }

    pub fn chain_length(&self) -> usize {
        self.inner.state.lock().ledger.len()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.state.lock().ledger.blocks().to_vec()
    }

    pub fn blocks_since(&self, index: u64) -> Vec<Block> {
        self.inner.state.lock().ledger.blocks_since(index).to_vec()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.inner.state.lock().mempool.iter().cloned().collect()
    }

    pub fn lookup(&self, id: &str) -> Option<Entity> {
        self.inner.state.lock().registries.lookup(id)
    }

    pub fn registries(&self) -> Registries {
        self.inner.state.lock().registries.clone()
    }

    // ---- mining ----------------------------------------------------------

    pub fn is_mining(&self) -> bool {
        self.inner.mining_active.load(Ordering::SeqCst)
    }

    /// Starts the worker and its driver task. A no-op when already mining.
    pub fn start_mining(&self) -> Result<(), NodeError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| NodeError::NoRuntime)?;
        {
            let mut control = self.inner.mining.lock();
            if self.inner.mining_active.load(Ordering::SeqCst) {
                return Ok(());
            }
            let session = self.inner.mining_session.fetch_add(1, Ordering::SeqCst) + 1;
            let (worker, events) = MiningWorker::spawn(WorkerConfig {
                yield_every: self.inner.mining_cfg.yield_every,
                channel_capacity: self.inner.mining_cfg.channel_capacity,
            });
            let driver = runtime.spawn(mining::drive(self.clone(), worker.sender(), events, session));
            control.worker = Some(worker);
            control.driver = Some(driver);
            self.inner.mining_active.store(true, Ordering::SeqCst);
        }
        info!(address = %self.inner.address, difficulty = self.inner.mining_cfg.difficulty, "mining started");
        self.emit_status("mining");
        Ok(())
    }

    /// Stops mining; idempotent. An in-flight hash search ends at its next iteration.
    pub fn stop_mining(&self) {
        {
            let mut control = self.inner.mining.lock();
            if !self.inner.mining_active.swap(false, Ordering::SeqCst) {
                return;
            }
            self.inner.mining_session.fetch_add(1, Ordering::SeqCst);
            if let Some(worker) = control.worker.take() {
                worker.try_send(WorkerCommand::Stop);
                worker.try_send(WorkerCommand::Shutdown);
            }
            // the driver notices the session change and exits on its own
            control.driver.take();
        }
        self.inner.mempool_signal.notify_one();
        info!(address = %self.inner.address, "mining stopped");
        self.emit_status("idle");
    }

    fn emit_status(&self, status: &str) {
        let chain_length = self.chain_length();
        self.emit(NodeEvent::NodeStatus {
            address: self.inner.address.clone(),
            mining_active: self.is_mining(),
            chain_length,
            status: status.to_owned(),
        });
    }

    fn mining_session(&self) -> u64 {
        self.inner.mining_session.load(Ordering::SeqCst)
    }
}

fn operation_metadata(key: &str, value: &str) -> Metadata {
    let mut m = Metadata::new();
    m.insert(key.to_owned(), serde_json::Value::String(value.to_owned()));
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::random::PinnedRandom;
    use serde_json::json;

    fn node_at(hour: u32) -> (Node, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_hour(hour));
        let deps = NodeDeps {
            clock: clock.clone(),
            random: Arc::new(PinnedRandom::zero()),
            ..NodeDeps::default()
        };
        let mut cfg = SimConfig::default();
        cfg.node.address = Some("node_test".into());
        (Node::new(&cfg, deps), clock)
    }

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn page_visit_outside_business_hours_pays_base_reward() {
        let (node, _) = node_at(20);
        let out = node.record_action("page_visit", Metadata::new());
        assert!(out.accepted);
        assert_eq!(out.multiplier, 1.0);
        assert_eq!(out.reward, 0.5);
        assert_eq!(node.get_balance(), 0.5);
    }

    #[test]
    fn engagement_and_business_hours_compound() {
        let (node, _) = node_at(10);
        let out = node.record_action("form_submit", meta(json!({"engagementScore": 50})));
        assert!((out.multiplier - 1.8).abs() < 1e-9);
        assert!((out.reward - 1.8).abs() < 1e-9);
    }

    #[test]
    fn rejected_action_changes_nothing() {
        let (node, _) = node_at(20);
        for _ in 0..10 {
            assert!(node.record_action("button_click", Metadata::new()).accepted);
        }
        let before = node.get_balance();
        let out = node.record_action("button_click", Metadata::new());
        assert!(!out.accepted);
        assert_eq!(out.reward, 0.0);
        assert!(matches!(out.reason, Some(RejectReason::BurstDetected { .. })));
        assert_eq!(node.get_balance(), before);
        assert_eq!(node.get_network_stats().rejected_actions, 1);
    }

    #[test]
    fn actions_may_name_another_actor() {
        let (node, _) = node_at(20);
        node.record_action("page_visit", meta(json!({"actor_id": "alice"})));
        assert!(node.consensus().profile(&ActorId("alice".into())).is_some());
        assert!(node.consensus().profile(&ActorId("node_test".into())).is_none());
    }

    #[test]
    fn privileged_operations_are_weighted_actions() {
        let (node, clock) = node_at(20);
        let contract = node.deploy_smart_contract("code", "token");
        assert!(contract.starts_with("contract_"));
        assert_eq!(node.get_balance(), 20.0);
        clock.advance_ms(2_000);
        let nft = node.mint_nft(Metadata::new(), 0.05);
        assert!(matches!(node.lookup(&nft), Some(Entity::Nft(_))));
        assert_eq!(node.get_balance(), 20.0 + 12.5);
        clock.advance_ms(2_000);
        node.bridge_assets("ethereum", 10.0, "BNE");
        assert_eq!(node.get_balance(), 20.0 + 12.5 + 32.0);
        let stats = node.get_network_stats();
        assert_eq!((stats.contracts, stats.nfts, stats.bridges), (1, 1, 1));
    }

    #[test]
    fn spends_require_balance() {
        let (node, _) = node_at(20);
        let err = node.burn_tokens(1.0).unwrap_err();
        assert_eq!(
            err,
            NodeError::InsufficientBalance {
                needed: 1.0,
                available: 0.0
            }
        );
        node.record_action("social_share", Metadata::new());
        let tx = node.transfer(Address::from("bob"), 1.5).unwrap();
        assert_eq!(tx.kind, TxKind::Transfer);
        assert_eq!(node.get_balance(), 0.5);
        assert_eq!(node.pending_transactions().len(), 1);
        assert_eq!(node.transfer(Address::from(""), 0.1).unwrap_err(), NodeError::MissingParty);
        assert!(matches!(node.burn_tokens(-1.0), Err(NodeError::InvalidAmount(_))));
    }

    #[test]
    fn staking_bounds_vote_weight() {
        let (node, clock) = node_at(20);
        node.deploy_smart_contract("c", "dao");
        let pool = node.create_staking_pool("main", 0.12, 1.0);
        let proposal = node.create_governance_proposal("raise apy", "", 60_000);

        clock.advance_ms(2_000);
        let rejected = node.vote_on_proposal(&proposal, true, 5.0).unwrap();
        assert!(!rejected.accepted);

        node.stake(&pool, 6.0).unwrap();
        clock.advance_ms(2_000);
        let vote = node.vote_on_proposal(&proposal, true, 5.0).unwrap();
        assert!(vote.accepted);
        assert_eq!(vote.votes_for, 5.0);
        assert!(vote.reward > 0.0);

        assert!(matches!(node.unstake(&pool, 7.0), Err(NodeError::InsufficientBalance { .. })));
        node.unstake(&pool, 6.0).unwrap();
        let staked = node.consensus().profile(&ActorId("node_test".into())).unwrap().staking_balance;
        assert_eq!(staked, 0.0);
    }

    #[test]
    fn vote_rate_holds_when_burst_gate_rejects_the_action() {
        let (node, clock) = node_at(20);
        node.deploy_smart_contract("c", "dao");
        let pool = node.create_staking_pool("main", 0.12, 1.0);
        let proposal = node.create_governance_proposal("p", "", 600_000);
        clock.advance_ms(2_000);
        node.stake(&pool, 8.0).unwrap();

        let mut accepted = 0;
        for _ in 0..8 {
            clock.advance_ms(1_100);
            for _ in 0..10 {
                node.record_action("page_visit", Metadata::new());
            }
            let vote = node.vote_on_proposal(&proposal, true, 1.0).unwrap();
            if vote.accepted {
                accepted += 1;
            } else {
                assert_eq!(vote.reward, 0.0);
            }
        }
        assert!(accepted <= 5, "{accepted} votes accepted");
        let counted = node.registries().proposals[&proposal].votes_for;
        assert_eq!(counted, accepted as f64);
    }

    #[test]
    fn at_most_five_votes_per_minute() {
        let (node, clock) = node_at(20);
        node.deploy_smart_contract("c", "dao");
        let pool = node.create_staking_pool("main", 0.12, 1.0);
        let proposal = node.create_governance_proposal("p", "", 600_000);
        clock.advance_ms(2_000);
        node.stake(&pool, 8.0).unwrap();

        let results: Vec<bool> = (0..7)
            .map(|_| {
                clock.advance_ms(2_000);
                node.vote_on_proposal(&proposal, true, 1.0).unwrap().accepted
            })
            .collect();
        assert_eq!(results, vec![true, true, true, true, true, false, false]);
        assert_eq!(node.registries().proposals[&proposal].votes_for, 5.0);
    }

    #[test]
    fn unknown_and_closed_entities() {
        let (node, clock) = node_at(20);
        assert!(matches!(node.stake("pool_1_x", 1.0), Err(NodeError::NotFound { .. })));
        assert!(matches!(node.unstake("pool_1_x", 1.0), Err(NodeError::NotFound { .. })));
        assert!(matches!(
            node.vote_on_proposal("proposal_1_x", true, 0.0),
            Err(NodeError::NotFound { .. })
        ));
        assert!(matches!(node.complete_bridge("bridge_1_x"), Err(NodeError::NotFound { .. })));

        let proposal = node.create_governance_proposal("t", "d", 1_000);
        clock.advance_ms(1_001);
        assert_eq!(
            node.vote_on_proposal(&proposal, true, 0.0).unwrap_err(),
            NodeError::ProposalClosed(proposal.clone())
        );
    }

    #[test]
    fn complete_bridge_marks_completion() {
        let (node, _) = node_at(20);
        let id = node.bridge_assets("polygon", 1.0, "BNE");
        assert_eq!(node.complete_bridge(&id).unwrap().status, BridgeStatus::Completed);
    }

    #[test]
    fn start_mining_needs_a_runtime() {
        let (node, _) = node_at(20);
        assert_eq!(node.start_mining().unwrap_err(), NodeError::NoRuntime);
        node.stop_mining();
        assert!(!node.is_mining());
    }
}
