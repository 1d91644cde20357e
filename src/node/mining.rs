//! Driver task between the node and its mining worker.
//!
//! One driver runs per mining session. It snapshots a candidate block from the
//! mempool, hands it to the worker, and commits whatever comes back. A block
//! returned after the session ended, or whose transactions are no longer all
//! pending, is discarded.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Node;
use crate::audit::AuditEvent;
use crate::events::NodeEvent;
use crate::ledger::{Block, Transaction, TxKind, TxStatus};
use crate::types::Address;
use crate::worker::{MineJob, WorkerCommand, WorkerEvent};

/// Sender of coinbase transactions.
pub const COINBASE: &str = "coinbase";

pub(super) async fn drive(
    node: Node,
    commands: mpsc::Sender<WorkerCommand>,
    mut events: mpsc::Receiver<WorkerEvent>,
    session: u64,
) {
    let idle = Duration::from_millis(node.inner.mining_cfg.idle_poll_ms.max(1));
    debug!(session, "mining driver started");
    loop {
        if node.mining_session() != session {
            break;
        }
        // nothing is hashed until a transaction is pending
        let Some(job) = node.next_job() else {
            tokio::select! {
                _ = node.inner.mempool_signal.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
            continue;
        };
        if commands.send(WorkerCommand::Mine(job)).await.is_err() {
            break;
        }
        match events.recv().await {
            Some(WorkerEvent::BlockFound {
                block,
                attempts,
                elapsed,
            }) => node.commit_block(session, block, attempts, elapsed),
            Some(WorkerEvent::Stopped { attempts }) => {
                debug!(session, attempts, "hash search stopped");
            }
            Some(WorkerEvent::Failed { reason }) => {
                warn!(session, %reason, "mining attempt failed");
                node.telemetry().incr("mining.failed");
            }
            None => break,
        }
    }
    debug!(session, "mining driver exited");
}

impl Node {
    /// Candidate block over the current tip: a coinbase plus a mempool prefix.
    /// `None` while the mempool is empty.
    fn next_job(&self) -> Option<MineJob> {
        let cfg = &self.inner.mining_cfg;
        let timestamp = self.inner.deps.clock.now_ms();
        let state = self.inner.state.lock();
        if state.mempool.is_empty() {
            return None;
        }
        let tip = state.ledger.tip();
        let index = tip.index + 1;

        let coinbase = Transaction::pending(
            Address::from(COINBASE),
            self.inner.address.clone(),
            cfg.block_reward,
            TxKind::Reward,
            timestamp,
            &format!("{COINBASE}:{index}"),
        );
        let mut transactions = Vec::with_capacity(cfg.max_block_txs);
        transactions.push(coinbase);
        transactions.extend(state.mempool.peek_prefix(cfg.max_block_txs.saturating_sub(1)));
        for tx in &mut transactions {
            tx.status = TxStatus::Confirmed;
        }

        Some(MineJob {
            index,
            previous_hash: tip.hash.clone(),
            transactions,
            timestamp,
            difficulty: cfg.difficulty,
        })
    }

    fn commit_block(&self, session: u64, block: Block, attempts: u64, elapsed: Duration) {
        if self.mining_session() != session {
            debug!(index = block.index, "block from a stopped session discarded");
            return;
        }
        let coinbase = Address::from(COINBASE);
        let hashes: Vec<String> = block
            .transactions
            .iter()
            .filter(|tx| tx.from != coinbase)
            .map(|tx| tx.hash.clone())
            .collect();
        let refs: Vec<&str> = hashes.iter().map(String::as_str).collect();

        let hash_rate = attempts as f64 / elapsed.as_secs_f64().max(1e-6);
        let (committed, balance, inbound) = {
            let mut state = self.inner.state.lock();
            if !refs.iter().all(|h| state.mempool.contains(h)) {
                warn!(index = block.index, "block references transactions no longer pending; discarded");
                return;
            }
            let committed = match state.ledger.append(block) {
                Ok(b) => b.clone(),
                Err(e) => {
                    warn!(error = %e, "mined block rejected by ledger");
                    return;
                }
            };
            state.mempool.consume(&refs);
            state.blocks_mined += 1;
            state.hash_rate = hash_rate;
            let inbound: f64 = committed
                .transactions
                .iter()
                .filter(|tx| tx.to == self.inner.address)
                .map(|tx| tx.amount)
                .sum();
            let balance = state.balance(&self.inner.address);
            (committed, balance, inbound)
        };

        info!(
            index = committed.index,
            hash = %committed.hash,
            txs = committed.transactions.len(),
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "block mined"
        );
        self.telemetry().incr("blocks.mined");
        self.telemetry()
            .record_latency_ms("mining.block_ms", elapsed.as_millis() as u64);
        self.audit(AuditEvent::block_mined(
            committed.index,
            committed.hash.clone(),
            self.inner.address.clone(),
            committed.transactions.len(),
            attempts,
            committed.timestamp,
        ));

        for tx in &committed.transactions {
            self.emit(NodeEvent::TransactionConfirmed {
                hash: tx.hash.clone(),
                block_hash: committed.hash.clone(),
                block_index: committed.index,
            });
        }
        self.emit(NodeEvent::MiningReward {
            address: self.inner.address.clone(),
            block_hash: committed.hash.clone(),
            amount: self.inner.mining_cfg.block_reward,
            attempts,
        });
        self.emit_balance(balance, inbound, "block_reward");
        self.emit_status("mining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SimConfig;
    use crate::node::NodeDeps;
    use crate::random::PinnedRandom;
    use std::sync::Arc;

    fn node() -> Node {
        let mut cfg = SimConfig::default();
        cfg.node.address = Some("node_m".into());
        cfg.mining.difficulty = 1;
        cfg.mining.max_block_txs = 3;
        Node::new(
            &cfg,
            NodeDeps {
                clock: Arc::new(ManualClock::at_hour(20)),
                random: Arc::new(PinnedRandom::zero()),
                ..NodeDeps::default()
            },
        )
    }

    fn mine(job: &MineJob) -> Block {
        let prefix = crate::ledger::block_prefix(&job.transactions, &job.previous_hash, job.timestamp).unwrap();
        let mut nonce = 0u64;
        loop {
            let hash = crate::ledger::seal(&prefix, nonce);
            if crate::ledger::meets_difficulty(&hash, job.difficulty) {
                return Block {
                    index: job.index,
                    hash,
                    previous_hash: job.previous_hash.clone(),
                    transactions: job.transactions.clone(),
                    timestamp: job.timestamp,
                    nonce,
                    difficulty: job.difficulty,
                };
            }
            nonce += 1;
        }
    }

    #[test]
    fn job_is_coinbase_plus_mempool_prefix() {
        let node = node();
        for i in 0..4 {
            node.create_transaction(Address(format!("peer_{i}")), 1.0, TxKind::Trade)
                .unwrap();
        }
        let job = node.next_job().unwrap();
        assert_eq!(job.index, 1);
        assert_eq!(job.transactions.len(), 3);
        assert_eq!(job.transactions[0].kind, TxKind::Reward);
        assert!(job.transactions.iter().all(|tx| tx.status == TxStatus::Confirmed));
    }

    #[test]
    fn committed_block_consumes_mempool_once() {
        let node = node();
        node.create_transaction(Address::from("bob"), 1.0, TxKind::Transfer).unwrap();
        let session = node.mining_session();
        let block = mine(&node.next_job().unwrap());
        let replay = block.clone();

        node.commit_block(session, block, 10, Duration::from_millis(5));
        assert_eq!(node.chain_length(), 2);
        assert!(node.pending_transactions().is_empty());
        assert_eq!(node.get_balance(), 2.5);

        node.commit_block(session, replay, 10, Duration::from_millis(5));
        assert_eq!(node.chain_length(), 2);
    }

    #[test]
    fn stale_session_block_is_discarded() {
        let node = node();
        node.create_transaction(Address::from("bob"), 1.0, TxKind::Transfer).unwrap();
        let session = node.mining_session();
        let block = mine(&node.next_job().unwrap());
        node.inner
            .mining_session
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        node.commit_block(session, block, 1, Duration::from_millis(1));
        assert_eq!(node.chain_length(), 1);
    }

    #[test]
    fn empty_mempool_yields_no_job() {
        let node = node();
        assert!(node.next_job().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_miner_leaves_chain_at_genesis() {
        let node = node();
        node.start_mining().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node.chain_length(), 1);
        assert_eq!(node.get_balance(), 0.0);
        node.stop_mining();
    }
}
