//! Read path: chain following, override, caching, anonymity and the
//! unresolved terminals.

mod common;

use chrono::{Duration, Utc};
use common::{an_hour_ago, harness, harness_with, node_ids};
use delegation_engine::core::config::EngineConfig;
use delegation_engine::engine::chain::{HopRule, Terminal, TerminalKind, UnresolvedReason};
use delegation_engine::engine::events::GovernanceEvent;
use delegation_engine::engine::model::{CacheKey, DelegationMode, NewEdge, TargetRef};

#[test]
fn global_then_poll_specific_chain() {
    let h = harness();
    h.users(&["a", "b", "c"]);
    h.delegate("a", "b");
    h.delegate_on("b", "c", "p");

    let r = h.engine.service.resolve("a", Some("p")).unwrap();
    assert_eq!(node_ids(&r.chain), vec!["a", "b", "c"]);
    assert_eq!(r.terminal, TerminalKind::Person);
    assert_eq!(
        r.chain.terminal,
        Terminal::Target {
            target: TargetRef::user("c")
        }
    );
    let rules: Vec<HopRule> = r
        .chain
        .hops
        .iter()
        .filter_map(|h| h.via.as_ref().map(|e| e.rule))
        .collect();
    assert_eq!(rules, vec![HopRule::GlobalDefault, HopRule::PollSpecific]);
    assert!(!r.cache_hit);
}

#[test]
fn global_resolution_ignores_poll_edges() {
    let h = harness();
    h.users(&["a", "b"]);
    h.delegate_on("a", "b", "p");

    let r = h.engine.service.resolve("a", None).unwrap();
    assert_eq!(node_ids(&r.chain), vec!["a"]);
    assert_eq!(
        r.chain.terminal,
        Terminal::Target {
            target: TargetRef::user("a")
        }
    );
}

#[test]
fn intermediate_vote_ends_the_chain() {
    let h = harness();
    h.users(&["a", "b", "c"]);
    h.delegate("a", "b");
    h.delegate_on("b", "c", "p");
    h.engine.ledger.cast_vote("b", "p").unwrap();

    let r = h.engine.service.resolve("a", Some("p")).unwrap();
    assert_eq!(node_ids(&r.chain), vec!["a", "b"]);
    assert_eq!(
        r.chain.terminal,
        Terminal::DirectVote {
            voter: "b".to_string()
        }
    );
    assert_eq!(r.terminal, TerminalKind::DirectVote);
}

#[test]
fn intermediate_vote_on_a_warm_chain_ends_it() {
    let h = harness();
    h.users(&["a", "b", "c"]);
    h.delegate("a", "b");
    h.delegate_on("b", "c", "p");

    let warm = h.engine.service.resolve("a", Some("p")).unwrap();
    assert_eq!(node_ids(&warm.chain), vec!["a", "b", "c"]);
    assert!(h.engine.service.resolve("a", Some("p")).unwrap().cache_hit);

    let receipt = h.engine.ledger.cast_vote("b", "p").unwrap();
    assert_eq!(receipt.invalidated, vec![CacheKey::new("a", Some("p"))]);

    let r = h.engine.service.resolve("a", Some("p")).unwrap();
    assert!(!r.cache_hit);
    assert_eq!(node_ids(&r.chain), vec!["a", "b"]);
    assert_eq!(
        r.chain.terminal,
        Terminal::DirectVote {
            voter: "b".to_string()
        }
    );
}

#[test]
fn repeated_resolution_is_byte_identical_and_cached() {
    let h = harness();
    h.users(&["a", "b", "c"]);
    h.delegate("a", "b");
    h.delegate("b", "c");

    let first = h.engine.service.resolve("a", Some("p")).unwrap();
    let second = h.engine.service.resolve("a", Some("p")).unwrap();
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(
        serde_json::to_vec(&first.chain).unwrap(),
        serde_json::to_vec(&second.chain).unwrap()
    );
    let stored = h
        .engine
        .service
        .cache()
        .get(&CacheKey::new("a", Some("p")), Utc::now())
        .unwrap();
    assert_eq!(stored.payload(), serde_json::to_vec(&first.chain).unwrap().as_slice());
    assert_eq!(second.latency.query_count, 0);
    assert!(first.latency.query_count >= 1);

    let stats = h.engine.service.cache().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[test]
fn own_vote_overrides_a_warm_cache() {
    let h = harness();
    h.users(&["a", "b"]);
    h.delegate("a", "b");

    let before = h.engine.service.resolve("a", Some("p")).unwrap();
    assert_eq!(node_ids(&before.chain), vec!["a", "b"]);
    assert!(h.engine.service.resolve("a", Some("p")).unwrap().cache_hit);

    let receipt = h.engine.ledger.cast_vote("a", "p").unwrap();
    assert!(receipt.newly_cast);
    assert_eq!(receipt.invalidated, vec![CacheKey::new("a", Some("p"))]);

    let after = h.engine.service.resolve("a", Some("p")).unwrap();
    assert!(!after.cache_hit);
    assert_eq!(node_ids(&after.chain), vec!["a"]);
    assert_eq!(
        after.chain.terminal,
        Terminal::DirectVote {
            voter: "a".to_string()
        }
    );
    assert!(h.engine.service.has_direct_vote("a", "p").unwrap());

    // Other polls are untouched by the vote.
    let other = h.engine.service.resolve("a", Some("q")).unwrap();
    assert_eq!(node_ids(&other.chain), vec!["a", "b"]);
}

#[test]
fn public_resolution_masks_anonymous_delegators() {
    let h = harness();
    h.users(&["a", "b"]);
    h.create(NewEdge::new("a", TargetRef::user("b")).anonymous());

    let public = h.engine.service.resolve_public("a", None).unwrap();
    assert!(public.chain.delegator_id.starts_with("anon-"));
    assert_eq!(public.chain.hops[0].node, TargetRef::User(public.chain.delegator_id.clone()));
    assert_eq!(public.chain.hops[1].node, TargetRef::user("b"));

    let internal = h.engine.service.resolve("a", None).unwrap();
    assert_eq!(internal.chain.delegator_id, "a");
    assert!(internal.cache_hit);
}

#[test]
fn non_user_targets_terminate() {
    let h = harness();
    h.users(&["a", "b"]);
    let climate = TargetRef::new(delegation_engine::engine::model::TargetKind::Field, "climate");
    h.target(&climate);
    h.delegate("a", "b");
    h.create(NewEdge::new("b", climate.clone()));

    let r = h.engine.service.resolve("a", None).unwrap();
    assert_eq!(r.terminal, TerminalKind::Field);
    assert_eq!(r.chain.terminal, Terminal::Target { target: climate });
}

#[test]
fn deactivated_target_leaves_chain_dangling() {
    let h = harness();
    h.users(&["a", "b"]);
    h.delegate("a", "b");
    assert_eq!(h.engine.service.resolve("a", None).unwrap().terminal, TerminalKind::Person);

    let receipt = h
        .engine
        .ledger
        .set_target_active(&TargetRef::user("b"), false)
        .unwrap();
    assert!(receipt.invalidated.contains(&CacheKey::new("a", None)));

    let r = h.engine.service.resolve("a", None).unwrap();
    assert_eq!(
        r.chain.terminal,
        Terminal::Unresolved {
            reason: UnresolvedReason::Dangling,
            at: Some(TargetRef::user("b")),
        }
    );
}

#[test]
fn unknown_delegator_is_dangling() {
    let h = harness();
    let r = h.engine.service.resolve("ghost", Some("p")).unwrap();
    assert_eq!(r.chain.terminal.unresolved_reason(), Some(UnresolvedReason::Dangling));
}

#[test]
fn depth_cap_yields_unresolved() {
    let h = harness_with(EngineConfig {
        max_depth: 3,
        ..EngineConfig::default()
    });
    let ids = ["u0", "u1", "u2", "u3", "u4", "u5"];
    h.users(&ids);
    for pair in ids.windows(2) {
        h.delegate(pair[0], pair[1]);
    }

    let r = h.engine.service.resolve("u0", None).unwrap();
    assert_eq!(r.chain.depth(), 3);
    assert_eq!(
        r.chain.terminal,
        Terminal::Unresolved {
            reason: UnresolvedReason::DepthExceeded,
            at: Some(TargetRef::user("u4")),
        }
    );
}

#[test]
fn timeouts_are_reported_and_never_cached() {
    let h = harness_with(EngineConfig {
        deadline_ms: 0,
        ..EngineConfig::default()
    });
    h.users(&["a", "b"]);
    h.delegate("a", "b");

    for _ in 0..2 {
        let r = h.engine.service.resolve("a", None).unwrap();
        assert!(!r.cache_hit);
        assert_eq!(r.chain.terminal.unresolved_reason(), Some(UnresolvedReason::Timeout));
    }
    let stats = h.engine.service.cache().stats();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(h.engine.service.slo_report().timeouts, 2);

    let timeouts = h
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, GovernanceEvent::ResolutionTimeout { .. }))
        .count();
    assert_eq!(timeouts, 2);
}

#[test]
fn cached_answer_expires_with_its_earliest_edge() {
    let h = harness();
    h.users(&["a", "b"]);
    let now = Utc::now();
    h.engine
        .ledger
        .create_edge_at(
            &NewEdge::new("a", TargetRef::user("b"))
                .starting(now - Duration::hours(2))
                .ending(now + Duration::seconds(2)),
            an_hour_ago(),
        )
        .unwrap();

    let before = h.engine.service.resolve("a", None).unwrap();
    assert_eq!(node_ids(&before.chain), vec!["a", "b"]);

    std::thread::sleep(std::time::Duration::from_millis(3100));

    let after = h.engine.service.resolve("a", None).unwrap();
    assert!(!after.cache_hit);
    assert_eq!(node_ids(&after.chain), vec!["a"]);
    assert_eq!(h.engine.service.cache().stats().expirations, 1);
}

#[test]
fn stats_forget_chains_through_expired_edges() {
    let h = harness();
    h.users(&["a", "b"]);
    let now = Utc::now();
    h.engine
        .ledger
        .create_edge_at(
            &NewEdge::new("a", TargetRef::user("b"))
                .for_poll("p")
                .starting(now - Duration::hours(2))
                .ending(now + Duration::seconds(2)),
            an_hour_ago(),
        )
        .unwrap();

    h.engine.service.resolve("a", Some("p")).unwrap();
    let live = h.engine.service.stats(Some("p")).unwrap();
    assert_eq!(live.active_edge_count, 1);
    assert_eq!(live.concentration.shares.len(), 1);
    assert_eq!(live.concentration.shares[0].target, TargetRef::user("b"));

    std::thread::sleep(std::time::Duration::from_millis(3100));

    // No lookup of a@p happens before the snapshot.
    let stats = h.engine.service.stats(Some("p")).unwrap();
    assert_eq!(stats.active_edge_count, 0);
    assert_eq!(stats.concentration.resolved, 0);
    assert!(stats.concentration.shares.is_empty());
    assert_eq!(stats.cache.entries, 0);
    assert_eq!(stats.cache.expirations, 1);
}

#[test]
fn batch_resolution_keeps_input_order() {
    let h = harness();
    h.users(&["a", "b", "c", "d", "hub"]);
    for u in ["a", "b", "c"] {
        h.delegate(u, "d");
    }
    h.delegate("d", "hub");
    h.engine.ledger.cast_vote("b", "p").unwrap();

    let ids: Vec<String> = ["c", "a", "b", "hub"].iter().map(|s| s.to_string()).collect();
    let first = h.engine.service.resolve_many(&ids, Some("p")).unwrap();
    let origins: Vec<&str> = first.iter().map(|r| r.chain.delegator_id.as_str()).collect();
    assert_eq!(origins, vec!["c", "a", "b", "hub"]);
    assert_eq!(node_ids(&first[0].chain), vec!["c", "d", "hub"]);
    assert_eq!(node_ids(&first[1].chain), vec!["a", "d", "hub"]);
    assert_eq!(first[2].terminal, TerminalKind::DirectVote);
    assert!(first.iter().all(|r| !r.cache_hit));

    // Batch answers agree with single resolutions and are now cached.
    let single = h.engine.service.resolve("a", Some("p")).unwrap();
    assert!(single.cache_hit);
    assert_eq!(single.chain, first[1].chain);

    let second = h.engine.service.resolve_many(&ids, Some("p")).unwrap();
    assert!(second.iter().all(|r| r.cache_hit));
}

#[test]
fn stats_report_concentration_and_can_be_busted() {
    let h = harness();
    let voters: Vec<String> = (0..20).map(|i| format!("v{i}")).collect();
    let mut all: Vec<&str> = voters.iter().map(String::as_str).collect();
    all.push("hub");
    h.users(&all);
    for v in &voters {
        h.delegate_on(v, "hub", "p");
    }

    h.engine.service.resolve_many(&voters, Some("p")).unwrap();
    let stats = h.engine.service.stats(Some("p")).unwrap();
    assert_eq!(stats.active_edge_count, 20);
    assert_eq!(stats.concentration.resolved, 20);
    assert_eq!(stats.concentration.shares.len(), 1);
    let top = &stats.concentration.shares[0];
    assert_eq!(top.target, TargetRef::user("hub"));
    assert!((top.share - 1.0).abs() < f64::EPSILON);
    assert!(top.above_cap);

    let signals = h
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, GovernanceEvent::ConcentrationSoftCap(_)))
        .count();
    assert_eq!(signals, 1);

    // Without a poll every active edge counts.
    assert_eq!(h.engine.service.stats(None).unwrap().active_edge_count, 20);

    let evicted = h.engine.service.invalidate_stats(Some("p"));
    assert_eq!(evicted.len(), 20);
    let stats = h.engine.service.stats(Some("p")).unwrap();
    assert_eq!(stats.concentration.resolved, 0);
    assert!(stats.concentration.shares.is_empty());
    assert_eq!(stats.cache.entries, 0);
}

#[test]
fn hybrid_seed_is_refined_per_poll() {
    let h = harness();
    h.users(&["a", "generalist", "specialist"]);
    h.create(NewEdge::new("a", TargetRef::user("generalist")).with_mode(DelegationMode::HybridSeed));
    h.create(NewEdge::new("a", TargetRef::user("specialist")).for_poll("budget"));

    let budget = h.engine.service.resolve("a", Some("budget")).unwrap();
    assert_eq!(node_ids(&budget.chain), vec!["a", "specialist"]);
    assert_eq!(
        budget.chain.hops[1].via.as_ref().map(|e| e.rule),
        Some(HopRule::HybridRefinement)
    );

    let other = h.engine.service.resolve("a", Some("parks")).unwrap();
    assert_eq!(node_ids(&other.chain), vec!["a", "generalist"]);
}

#[test]
fn outgoing_edges_and_targets_are_read_from_the_store() {
    let h = harness();
    h.users(&["a", "b", "c"]);
    let global = h.delegate("a", "b");
    let on_p = h.delegate_on("a", "c", "p");
    h.delegate_on("a", "c", "q");

    let ids = |poll: Option<&str>| {
        let mut ids: Vec<String> = h
            .engine
            .service
            .outgoing_edges("a", poll)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(None), vec![global.id.clone()]);
    let mut expected = vec![global.id.clone(), on_p.id.clone()];
    expected.sort();
    assert_eq!(ids(Some("p")), expected);

    h.engine.ledger.revoke_edge(&global.id).unwrap();
    assert!(ids(None).is_empty());

    h.engine
        .ledger
        .set_target_active(&TargetRef::user("c"), false)
        .unwrap();
    let c = h.engine.service.target(&TargetRef::user("c")).unwrap().unwrap();
    assert!(!c.is_active);
    assert!(h.engine.service.target(&TargetRef::user("ghost")).unwrap().is_none());
}
