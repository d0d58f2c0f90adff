//! Randomized write sequences: whatever the ledger accepts, resolution never
//! meets a cycle, batches agree with single resolutions, and each poll's
//! concentration shares add up.

mod common;

use common::harness;
use delegation_engine::engine::chain::UnresolvedReason;
use delegation_engine::engine::model::{NewEdge, TargetRef};
use proptest::prelude::*;

const USERS: [&str; 6] = ["u0", "u1", "u2", "u3", "u4", "u5"];
const POLLS: [Option<&str>; 3] = [None, Some("p"), Some("q")];

#[derive(Debug, Clone)]
enum Op {
    Delegate { from: usize, to: usize, poll: usize },
    Vote { user: usize, poll: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..USERS.len(), 0..USERS.len(), 0..POLLS.len())
            .prop_map(|(from, to, poll)| Op::Delegate { from, to, poll }),
        1 => (0..USERS.len(), 1..POLLS.len()).prop_map(|(user, poll)| Op::Vote { user, poll }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn accepted_writes_never_resolve_into_a_cycle(ops in prop::collection::vec(op_strategy(), 1..30)) {
        let h = harness();
        h.users(&USERS);

        for op in &ops {
            match *op {
                Op::Delegate { from, to, poll } => {
                    let mut new = NewEdge::new(USERS[from], TargetRef::user(USERS[to]));
                    if let Some(p) = POLLS[poll] {
                        new = new.for_poll(p);
                    }
                    // Rejections (cycles, limits) are expected.
                    let _ = h.engine.ledger.create_edge(&new);
                }
                Op::Vote { user, poll } => {
                    if let Some(p) = POLLS[poll] {
                        h.engine.ledger.cast_vote(USERS[user], p).unwrap();
                    }
                }
            }

            for poll in POLLS {
                for user in USERS {
                    let r = h.engine.service.resolve(user, poll).unwrap();
                    prop_assert_ne!(r.chain.terminal.unresolved_reason(), Some(UnresolvedReason::Cycle));
                }
            }
        }
    }

    #[test]
    fn batches_match_single_resolutions_and_shares_sum_to_one(
        ops in prop::collection::vec(op_strategy(), 1..30)
    ) {
        let h = harness();
        h.users(&USERS);
        for op in &ops {
            match *op {
                Op::Delegate { from, to, poll } => {
                    let mut new = NewEdge::new(USERS[from], TargetRef::user(USERS[to]));
                    if let Some(p) = POLLS[poll] {
                        new = new.for_poll(p);
                    }
                    let _ = h.engine.ledger.create_edge(&new);
                }
                Op::Vote { user, poll } => {
                    if let Some(p) = POLLS[poll] {
                        h.engine.ledger.cast_vote(USERS[user], p).unwrap();
                    }
                }
            }
        }

        let ids: Vec<String> = USERS.iter().map(|u| u.to_string()).collect();
        for poll in POLLS {
            let batch = h.engine.service.resolve_many(&ids, poll).unwrap();

            let snapshot = h.engine.service.stats(poll).unwrap().concentration;
            prop_assert_eq!(snapshot.resolved + snapshot.unresolved, USERS.len() as u64);
            if snapshot.resolved > 0 {
                let total: f64 = snapshot.shares.iter().map(|s| s.share).sum();
                prop_assert!((total - 1.0).abs() < 1e-9);
            }

            h.engine.service.invalidate_stats(poll);
            for (user, batched) in USERS.iter().zip(&batch) {
                let single = h.engine.service.resolve(user, poll).unwrap();
                prop_assert!(!single.cache_hit);
                prop_assert_eq!(&single.chain, &batched.chain);
            }
        }
    }
}
