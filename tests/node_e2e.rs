use bitnun_sim::clock::ManualClock;
use bitnun_sim::config::SimConfig;
use bitnun_sim::events::{EventKind, NodeEvent};
use bitnun_sim::random::{PinnedRandom, SeededRandom};
use bitnun_sim::registry::Entity;
use bitnun_sim::store::MemoryStore;
use bitnun_sim::types::{Address, Metadata};
use bitnun_sim::Session;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

fn session_with(random: Arc<dyn bitnun_sim::random::RandomSource>, hour: u32) -> (Session, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_hour(hour));
    let mut cfg = SimConfig::default();
    cfg.node.address = Some("node_e2e".into());
    let session = Session::with_sources(cfg, Arc::new(MemoryStore::new()), clock.clone(), random).unwrap();
    (session, clock)
}

fn is_synthetic(id: &str, prefix: &str) -> bool {
    let parts: Vec<&str> = id.splitn(3, '_').collect();
    parts.len() == 3
        && parts[0] == prefix
        && !parts[1].is_empty()
        && parts[1].chars().all(|c| c.is_ascii_digit())
        && !parts[2].is_empty()
        && parts[2].chars().all(|c| c.is_ascii_alphanumeric())
}

#[test]
fn rewards_never_fall_below_base_when_bonus_is_pinned() {
    for hour in [3u32, 10, 20] {
        let (session, clock) = session_with(Arc::new(PinnedRandom::zero()), hour);
        let node = session.node();
        let kinds: Vec<(String, f64)> = node
            .reward_table()
            .kinds()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        for (i, (kind, base)) in kinds.iter().enumerate() {
            clock.advance_ms(1_500);
            let mut meta = Metadata::new();
            meta.insert("actor_id".into(), format!("user_{i}").into());
            let out = node.record_action(kind.as_str(), meta);
            assert!(out.accepted, "{kind} at {hour}h rejected");
            assert!(out.multiplier >= 1.0);
            assert!(out.reward >= *base - 1e-9, "{kind}: {} < {base}", out.reward);
        }
    }
}

#[test]
fn page_visit_then_contract_deploy() {
    let (session, clock) = session_with(Arc::new(SeededRandom::new(42)), 11);
    let node = session.node();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    session.events().on(EventKind::BalanceUpdate, move |event| {
        if let NodeEvent::BalanceUpdate { delta, .. } = event {
            sink.lock().push(*delta);
        }
    });

    let before = node.get_balance();
    let visit = node.record_action("page_visit", Metadata::new());
    assert!(visit.accepted);
    assert!((1.0..=1.8).contains(&visit.multiplier), "multiplier {}", visit.multiplier);
    assert!((visit.reward - 0.5 * visit.multiplier).abs() < 1e-9);
    assert!((node.get_balance() - (before + visit.reward)).abs() < 1e-9);

    clock.advance_ms(1_000);
    let contract = node.deploy_smart_contract("pragma sim;", "token");
    assert!(is_synthetic(&contract, "contract"), "{contract}");
    assert!(matches!(node.lookup(&contract), Some(Entity::SmartContract(_))));
    assert!(node.get_balance() > before + visit.reward);
    assert_eq!(updates.lock().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn balance_matches_confirmed_inbound_plus_earned_minus_spent() {
    let clock = Arc::new(ManualClock::at_hour(20));
    let mut cfg = SimConfig::default();
    cfg.node.address = Some("node_e2e".into());
    cfg.mining.difficulty = 1;
    cfg.sync.enabled = false;
    let session = Session::with_sources(
        cfg,
        Arc::new(MemoryStore::new()),
        clock.clone(),
        Arc::new(PinnedRandom::zero()),
    )
    .unwrap();
    let node = session.node();
    let me = node.address().clone();

    let mut earned = 0.0;
    for kind in ["social_share", "form_submit", "content_creation", "page_visit"] {
        let out = node.record_action(kind, Metadata::new());
        assert!(out.accepted);
        earned += out.reward;
    }
    clock.advance_ms(1_000);
    node.transfer(Address::from("peer"), 3.0).unwrap();
    node.burn_tokens(1.0).unwrap();
    let spent = 4.0;
    assert!(node.transfer(Address::from("peer"), 1_000.0).is_err());
    node.create_transaction(me.clone(), 4.0, bitnun_sim::ledger::TxKind::Transfer)
        .unwrap();

    node.start_mining().unwrap();
    for _ in 0..500 {
        if node.pending_transactions().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    node.stop_mining();
    assert!(node.pending_transactions().is_empty());
    assert!(node.chain_length() > 1);

    let inbound: f64 = node
        .blocks()
        .iter()
        .flat_map(|b| b.transactions.iter())
        .filter(|tx| tx.to == me)
        .map(|tx| tx.amount)
        .sum();
    let mined = (node.chain_length() - 1) as f64;
    assert!((inbound - (mined * 2.5 + 4.0)).abs() < 1e-9);
    assert!((node.get_balance() - (inbound + earned - spent)).abs() < 1e-9);
}

#[test]
fn sessions_do_not_share_state() {
    let (a, _) = session_with(Arc::new(PinnedRandom::zero()), 20);
    let (b, _) = session_with(Arc::new(PinnedRandom::zero()), 20);
    a.node().record_action("social_share", Metadata::new());
    assert_eq!(b.node().get_balance(), 0.0);
    assert_eq!(b.node().get_network_stats().accepted_actions, 0);
}
