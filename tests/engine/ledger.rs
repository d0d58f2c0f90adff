//! Write path: validation, cycle rejection, invalidation and auditing.

mod common;

use chrono::{Duration, Months, Timelike, Utc};
use common::{an_hour_ago, harness, harness_with, node_ids};
use delegation_engine::core::broker::read_audit_log;
use delegation_engine::core::config::EngineConfig;
use delegation_engine::core::error::EngineError;
use delegation_engine::engine::model::{CacheKey, DelegationMode, NewEdge, TargetKind, TargetRef};

#[test]
fn closing_a_cycle_is_rejected() {
    let h = harness();
    h.users(&["a", "b", "c"]);
    h.delegate("a", "b");
    h.delegate("b", "c");

    let err = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("c", TargetRef::user("a")))
        .unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected { ref delegator, .. } if delegator == "c"));
    assert!(err.is_client_error());

    // Nothing was persisted.
    let r = h.engine.service.resolve("c", None).unwrap();
    assert_eq!(node_ids(&r.chain), vec!["c"]);
}

#[test]
fn self_delegation_is_a_cycle() {
    let h = harness();
    h.users(&["a"]);
    let err = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("a", TargetRef::user("a")).for_poll("p"))
        .unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected { .. }));
}

#[test]
fn cycles_are_checked_across_global_and_poll_edges() {
    let h = harness();
    h.users(&["a", "b"]);
    h.delegate_on("a", "b", "p");

    // A global edge meets the poll edge when resolving p.
    let err = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("b", TargetRef::user("a")))
        .unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected { .. }));

    // The same pair on a different poll never resolves together.
    h.delegate_on("b", "a", "q");
}

#[test]
fn active_edge_limit_is_enforced() {
    let h = harness_with(EngineConfig {
        max_active_edges_per_delegator: 2,
        ..EngineConfig::default()
    });
    h.users(&["a", "b", "c", "d"]);
    let first = h.delegate_on("a", "b", "p1");
    h.delegate_on("a", "c", "p2");

    let err = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("a", TargetRef::user("d")).for_poll("p3"))
        .unwrap_err();
    assert!(matches!(err, EngineError::DelegationLimitExceeded { limit: 2, .. }));

    // Revoking frees a slot.
    h.engine.ledger.revoke_edge(&first.id).unwrap();
    h.delegate_on("a", "d", "p3");
}

#[test]
fn legacy_terms_are_capped() {
    let h = harness();
    h.users(&["a", "b"]);
    let start = Utc::now();
    let legacy = || NewEdge::new("a", TargetRef::user("b")).with_mode(DelegationMode::LegacyFixedTerm).starting(start);

    let open_ended = h.engine.ledger.create_edge(&legacy()).unwrap_err();
    assert!(matches!(
        open_ended,
        EngineError::LegacyTermExceeded { ref edge_end, .. } if edge_end == "open-ended"
    ));

    let too_long = start.checked_add_months(Months::new(5 * 12)).unwrap();
    let err = h.engine.ledger.create_edge(&legacy().ending(too_long)).unwrap_err();
    assert!(matches!(err, EngineError::LegacyTermExceeded { .. }));

    let at_cap = start.checked_add_months(Months::new(4 * 12)).unwrap();
    let receipt = h.engine.ledger.create_edge(&legacy().ending(at_cap)).unwrap();
    assert_eq!(receipt.edge.mode, DelegationMode::LegacyFixedTerm);
}

#[test]
fn empty_windows_are_rejected() {
    let h = harness();
    h.users(&["a", "b"]);
    let start = Utc::now();
    let err = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("a", TargetRef::user("b")).starting(start).ending(start))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidWindow(_)));
}

#[test]
fn targets_must_exist_and_be_active() {
    let h = harness();
    h.users(&["a", "b"]);

    let missing = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("a", TargetRef::new(TargetKind::Idea, "ubi")))
        .unwrap_err();
    assert!(matches!(missing, EngineError::InvalidTarget(_)));

    h.engine
        .ledger
        .set_target_active(&TargetRef::user("b"), false)
        .unwrap();
    let inactive = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("a", TargetRef::user("b")))
        .unwrap_err();
    assert!(matches!(inactive, EngineError::InvalidTarget(_)));

    // Re-registering reactivates.
    h.users(&["b"]);
    h.delegate("a", "b");

    assert!(matches!(
        h.engine.ledger.set_target_active(&TargetRef::user("nobody"), false),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        h.engine.ledger.register_target(&TargetRef::user(""), "blank"),
        Err(EngineError::ValidationError(_))
    ));
}

#[test]
fn new_edge_invalidates_chains_through_its_delegator() {
    let h = harness();
    h.users(&["x", "a", "b", "y"]);
    h.delegate("x", "a");
    h.engine.service.resolve("x", Some("p")).unwrap();
    h.engine.service.resolve("y", Some("p")).unwrap();

    let receipt = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("a", TargetRef::user("b")))
        .unwrap();
    assert_eq!(receipt.invalidated, vec![CacheKey::new("x", Some("p"))]);

    let r = h.engine.service.resolve("x", Some("p")).unwrap();
    assert!(!r.cache_hit);
    assert_eq!(node_ids(&r.chain), vec!["x", "a", "b"]);
    assert!(h.engine.service.resolve("y", Some("p")).unwrap().cache_hit);
}

#[test]
fn poll_edge_only_invalidates_its_poll() {
    let h = harness();
    h.users(&["a", "b"]);
    h.engine.service.resolve("a", Some("p")).unwrap();
    h.engine.service.resolve("a", Some("q")).unwrap();

    let receipt = h
        .engine
        .ledger
        .create_edge(&NewEdge::new("a", TargetRef::user("b")).for_poll("p"))
        .unwrap();
    assert_eq!(receipt.invalidated, vec![CacheKey::new("a", Some("p"))]);
    assert!(h.engine.service.resolve("a", Some("q")).unwrap().cache_hit);
}

#[test]
fn revoke_and_delete_take_effect_immediately() {
    let h = harness();
    h.users(&["x", "a", "b"]);
    h.delegate("x", "a");
    let edge = h.delegate("a", "b");
    assert_eq!(node_ids(&h.engine.service.resolve("x", None).unwrap().chain), vec!["x", "a", "b"]);

    let receipt = h.engine.ledger.revoke_edge(&edge.id).unwrap();
    assert!(receipt.edge.revoked_at.is_some());
    assert_eq!(receipt.invalidated, vec![CacheKey::new("x", None)]);
    assert_eq!(node_ids(&h.engine.service.resolve("x", None).unwrap().chain), vec!["x", "a"]);

    // Revoking twice is a no-op.
    let again = h.engine.ledger.revoke_edge(&edge.id).unwrap();
    assert_eq!(again.edge.revoked_at, receipt.edge.revoked_at.map(|t| t.with_nanosecond(0).unwrap()));

    let deleted = h.engine.ledger.delete_edge(&edge.id).unwrap();
    assert!(deleted.edge.is_deleted);
    assert!(matches!(
        h.engine.ledger.revoke_edge(&edge.id),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        h.engine.ledger.revoke_edge("01HZZZZZZZZZZZZZZZZZZZZZZZ"),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn votes_are_idempotent_and_validated() {
    let h = harness();
    h.users(&["a"]);
    assert!(h.engine.ledger.cast_vote("a", "p").unwrap().newly_cast);
    assert!(!h.engine.ledger.cast_vote("a", "p").unwrap().newly_cast);
    assert!(matches!(
        h.engine.ledger.cast_vote("a", ""),
        Err(EngineError::ValidationError(_))
    ));
}

#[test]
fn chain_origin_follows_upstream_edges() {
    let h = harness();
    h.users(&["x", "a", "b", "c"]);
    let upstream = h.delegate("x", "a");
    assert_eq!(upstream.chain_origin_id, upstream.id);

    let downstream = h.delegate("a", "b");
    assert_eq!(downstream.chain_origin_id, upstream.id);

    // A poll edge inherits from global upstream edges too.
    let poll_edge = h.delegate_on("b", "c", "p");
    assert_eq!(poll_edge.chain_origin_id, upstream.id);
}

#[test]
fn sweep_announces_each_expiry_once() {
    let h = harness();
    h.users(&["a", "b", "c"]);
    let now = Utc::now();
    let expiring = h
        .engine
        .ledger
        .create_edge_at(
            &NewEdge::new("a", TargetRef::user("b"))
                .starting(now - Duration::hours(3))
                .ending(now - Duration::minutes(30)),
            now - Duration::hours(2),
        )
        .unwrap()
        .edge;
    h.delegate("b", "c");

    let report = h.engine.ledger.sweep_expired(now).unwrap();
    assert_eq!(report.expired.len(), 1);
    assert_eq!(report.expired[0].id, expiring.id);
    assert_eq!(report.watermark, now);

    let again = h.engine.ledger.sweep_expired(now).unwrap();
    assert!(again.expired.is_empty());
    let later = h.engine.ledger.sweep_expired(now + Duration::hours(1)).unwrap();
    assert!(later.expired.is_empty());

    let r = h.engine.service.resolve("a", None).unwrap();
    assert_eq!(node_ids(&r.chain), vec!["a"]);
}

#[test]
fn sweep_evicts_chains_cached_through_the_expired_edge() {
    let h = harness();
    h.users(&["a", "b", "c", "x"]);
    let now = Utc::now();
    h.create(
        NewEdge::new("a", TargetRef::user("b"))
            .starting(now - Duration::hours(2))
            .ending(now + Duration::hours(1)),
    );
    h.delegate("b", "c");
    h.delegate("x", "c");

    let warm = h.engine.service.resolve("a", None).unwrap();
    assert_eq!(node_ids(&warm.chain), vec!["a", "b", "c"]);
    h.engine.service.resolve("x", None).unwrap();

    let report = h.engine.ledger.sweep_expired(now + Duration::hours(2)).unwrap();
    assert_eq!(report.expired.len(), 1);
    assert_eq!(report.invalidated, vec![CacheKey::new("a", None)]);

    assert!(!h.engine.service.resolve("a", None).unwrap().cache_hit);
    assert!(h.engine.service.resolve("x", None).unwrap().cache_hit);
}

#[test]
fn every_write_is_audited() {
    let h = harness();
    h.users(&["a", "b"]);
    h.delegate("a", "b");
    let _ = h.engine.ledger.create_edge(&NewEdge::new("b", TargetRef::user("a")));

    let log = read_audit_log(h.dir.path()).unwrap();
    let ops: Vec<(&str, &str)> = log.iter().map(|e| (e.op.as_str(), e.status.as_str())).collect();
    assert!(ops.contains(&("delegation.init", "success")));
    assert!(ops.contains(&("target.register", "success")));
    assert!(ops.contains(&("delegation.create", "success")));
    assert!(ops.contains(&("delegation.create", "error")));
    assert!(log.iter().all(|e| e.db_id == "delegation.db"));
}

#[test]
fn explicit_creation_time_is_recorded() {
    let h = harness();
    h.users(&["a", "b"]);
    let at = an_hour_ago();
    let edge = h.delegate("a", "b");
    assert!((edge.created_at - at).num_seconds().abs() <= 1);
    assert_eq!(edge.start_date, edge.created_at);
}
