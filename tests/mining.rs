use bitnun_sim::clock::SystemClock;
use bitnun_sim::config::SimConfig;
use bitnun_sim::events::{EventKind, NodeEvent};
use bitnun_sim::ledger::TxKind;
use bitnun_sim::random::PinnedRandom;
use bitnun_sim::store::MemoryStore;
use bitnun_sim::types::Address;
use bitnun_sim::Session;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn session(difficulty: u32) -> Session {
    let mut cfg = SimConfig::default();
    cfg.node.address = Some("node_miner".into());
    cfg.mining.difficulty = difficulty;
    cfg.mining.max_block_txs = 4;
    cfg.mining.idle_poll_ms = 20;
    cfg.sync.enabled = false;
    Session::with_sources(
        cfg,
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Arc::new(PinnedRandom::zero()),
    )
    .unwrap()
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mined_transactions_are_confirmed_exactly_once() {
    let s = session(1);
    let node = s.node();
    let mut hashes = HashSet::new();
    for i in 0..10 {
        let tx = node
            .create_transaction(Address(format!("peer_{i}")), 1.0, TxKind::Trade)
            .unwrap();
        hashes.insert(tx.hash);
    }
    node.start_mining().unwrap();
    wait_for(|| node.pending_transactions().is_empty()).await;
    node.stop_mining();

    let mut seen = HashSet::new();
    for block in node.blocks().iter().skip(1) {
        assert_eq!(block.transactions[0].kind, TxKind::Reward);
        assert!(block.hash.starts_with('0'));
        for tx in block.transactions.iter().skip(1) {
            assert!(seen.insert(tx.hash.clone()), "{} confirmed twice", tx.hash);
        }
    }
    assert_eq!(seen, hashes);
    let stats = node.get_network_stats();
    assert_eq!(stats.blocks_mined as usize, stats.chain_length - 1);
    assert!((node.get_balance() - (node.inbound_total() + node.action_rewards())).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rewards_and_confirmations_are_announced() {
    let s = session(1);
    let node = s.node();
    let rewards = Arc::new(AtomicUsize::new(0));
    let confirmed = Arc::new(AtomicUsize::new(0));
    {
        let rewards = rewards.clone();
        s.events().on(EventKind::MiningReward, move |e| {
            if let NodeEvent::MiningReward { amount, .. } = e {
                assert_eq!(*amount, 2.5);
                rewards.fetch_add(1, Ordering::SeqCst);
            }
        });
        let confirmed = confirmed.clone();
        s.events().on(EventKind::TransactionConfirmed, move |_| {
            confirmed.fetch_add(1, Ordering::SeqCst);
        });
    }
    node.create_transaction(Address::from("bob"), 1.0, TxKind::Transfer).unwrap();
    node.start_mining().unwrap();
    wait_for(|| rewards.load(Ordering::SeqCst) >= 1).await;
    node.stop_mining();
    assert!(confirmed.load(Ordering::SeqCst) >= 2);
    assert!(node.inbound_total() >= 2.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_idempotent_and_halts_the_chain() {
    let s = session(1);
    let node = s.node();
    for i in 0..3 {
        node.create_transaction(Address(format!("peer_{i}")), 1.0, TxKind::Transfer)
            .unwrap();
    }
    node.start_mining().unwrap();
    node.start_mining().unwrap();
    assert!(node.is_mining());
    wait_for(|| node.chain_length() > 1).await;

    node.stop_mining();
    node.stop_mining();
    assert!(!node.is_mining());
    // a block already in flight may still land; nothing after that
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = node.chain_length();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node.chain_length(), settled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_mempool_mines_nothing_until_work_arrives() {
    let s = session(1);
    let node = s.node();
    node.start_mining().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node.chain_length(), 1);
    assert_eq!(node.get_balance(), 0.0);

    node.create_transaction(Address::from("bob"), 1.0, TxKind::Transfer).unwrap();
    wait_for(|| node.chain_length() == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    node.stop_mining();
    assert_eq!(node.chain_length(), 2);
    assert_eq!(node.get_balance(), 2.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_interrupts_an_impossible_search() {
    let s = session(16);
    let node = s.node();
    node.create_transaction(Address::from("bob"), 1.0, TxKind::Transfer).unwrap();
    node.start_mining().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    node.stop_mining();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.chain_length(), 1);
    assert!(!node.is_mining());

    node.start_mining().unwrap();
    assert!(node.is_mining());
    node.stop_mining();
}
