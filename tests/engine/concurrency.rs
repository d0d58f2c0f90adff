//! Reads racing writes: no answer computed before a write may be cached
//! after it, and concurrent creations never close a cycle together.

mod common;

use chrono::Utc;
use common::{harness, node_ids};
use delegation_engine::engine::cache::{CachedResolution, DiscardReason, Lookup, PutOutcome};
use delegation_engine::engine::chain::{ResolvedChain, Terminal};
use delegation_engine::engine::model::{CacheKey, NewEdge, TargetRef};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn claim(lookup: Lookup) -> u64 {
    match lookup {
        Lookup::Miss { generation, .. } => generation,
        Lookup::Hit(_) => panic!("expected a miss"),
    }
}

#[test]
fn fill_computed_before_a_write_is_discarded() {
    let h = harness();
    h.users(&["a", "b"]);
    let cache = h.engine.service.cache();
    let key = CacheKey::new("a", Some("p"));

    let generation = claim(cache.lookup(&key, Utc::now()));
    let stale = ResolvedChain::origin_only(
        "a",
        Some("p"),
        Terminal::Target {
            target: TargetRef::user("a"),
        },
    );

    h.engine
        .ledger
        .create_edge(&NewEdge::new("a", TargetRef::user("b")))
        .unwrap();

    let entry = CachedResolution::from_chain(&stale, None).unwrap();
    let (outcome, _) = cache.put(&key, generation, entry);
    assert_eq!(outcome, PutOutcome::Discarded(DiscardReason::StaleGeneration));
    assert_eq!(cache.stats().discarded_puts, 1);

    let r = h.engine.service.resolve("a", Some("p")).unwrap();
    assert_eq!(node_ids(&r.chain), vec!["a", "b"]);
}

#[test]
fn concurrent_misses_share_one_fill() {
    let h = harness();
    let cache = h.engine.service.cache();
    let key = CacheKey::new("a", None);
    let now = Utc::now();

    let first = claim(cache.lookup(&key, now));
    let second = claim(cache.lookup(&key, now));
    assert_eq!(first, second);

    let chain = ResolvedChain::origin_only(
        "a",
        None,
        Terminal::Target {
            target: TargetRef::user("a"),
        },
    );
    let (stored, _) = cache.put(&key, first, CachedResolution::from_chain(&chain, None).unwrap());
    let (again, _) = cache.put(&key, second, CachedResolution::from_chain(&chain, None).unwrap());
    assert_eq!(stored, PutOutcome::Stored);
    assert_eq!(again, PutOutcome::Discarded(DiscardReason::AlreadyFilled));
    assert!(matches!(cache.lookup(&key, now), Lookup::Hit(_)));
}

#[test]
fn reads_started_after_a_vote_see_it() {
    let h = harness();
    h.users(&["a", "b", "c"]);
    h.delegate("a", "b");
    h.delegate("b", "c");
    let voted = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    let after_vote = voted.load(Ordering::SeqCst);
                    let r = h.engine.service.resolve("a", Some("p")).unwrap();
                    if after_vote {
                        assert_eq!(
                            r.chain.terminal,
                            Terminal::DirectVote {
                                voter: "a".to_string()
                            }
                        );
                    } else {
                        assert!(!r.chain.terminal.is_unresolved());
                    }
                }
            });
        }
        s.spawn(|| {
            thread::sleep(std::time::Duration::from_millis(5));
            h.engine.ledger.cast_vote("a", "p").unwrap();
            voted.store(true, Ordering::SeqCst);
        });
    });

    let r = h.engine.service.resolve("a", Some("p")).unwrap();
    assert_eq!(node_ids(&r.chain), vec!["a"]);
}

#[test]
fn racing_creations_never_form_a_cycle() {
    let h = harness();
    let pairs: Vec<(String, String)> = (0..6).map(|i| (format!("l{i}"), format!("r{i}"))).collect();
    for (l, r) in &pairs {
        h.users(&[l.as_str(), r.as_str()]);
    }

    let h = &h;
    thread::scope(|s| {
        for (l, r) in &pairs {
            let forward = s.spawn(move || {
                h.engine
                    .ledger
                    .create_edge(&NewEdge::new(l.as_str(), TargetRef::user(r.as_str())))
                    .is_ok()
            });
            let backward = s.spawn(move || {
                h.engine
                    .ledger
                    .create_edge(&NewEdge::new(r.as_str(), TargetRef::user(l.as_str())))
                    .is_ok()
            });
            let accepted = [forward.join().unwrap(), backward.join().unwrap()];
            assert_eq!(accepted.iter().filter(|ok| **ok).count(), 1);
        }
    });

    for (l, _) in &pairs {
        let r = h.engine.service.resolve(l, None).unwrap();
        assert!(!r.chain.terminal.is_unresolved());
    }
}
