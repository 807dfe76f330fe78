// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for pgcluster-operator.
//!
//! Uses proptest to generate random member sets and verify the invariants of
//! the scale-down and rolling upgrade planners.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use proptest::prelude::*;

use pgcluster_operator::client::{ClusterStatusSnapshot, Lsn, ReplicationStatus};
use pgcluster_operator::controller::cluster_scale::plan_scale_down;
use pgcluster_operator::controller::cluster_upgrade::plan_upgrade;
use pgcluster_operator::controller::intent::Intent;
use pgcluster_operator::controller::members::{
    ClusterView, Member, member_name_order, sorted_descending,
};
use pgcluster_operator::controller::upgrade_state_machine::{RolloutEvent, RolloutStateMachine};
use pgcluster_operator::crd::{ClusterPhase, PrimaryUpdateStrategy};

const SYSTEM_ID: &str = "7412345678901234567";
const OLD: &str = "postgres:16";
const NEW: &str = "postgres:17";

fn view(instances: i32, persistent: bool, strategy: PrimaryUpdateStrategy) -> ClusterView {
    ClusterView {
        name: "pg".to_string(),
        namespace: "default".to_string(),
        image_name: NEW.to_string(),
        instances,
        update_strategy: strategy,
        uses_persistent_storage: persistent,
        current_primary: None,
        target_primary: None,
        phase: ClusterPhase::Converged,
        postgres_port: 5432,
        resource_version: Some("1".to_string()),
        generation: Some(1),
    }
}

/// Strategy for generating distinct member serials (1-8 members).
fn serials() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::btree_set(0..200u32, 1..=8)
        .prop_map(|set| set.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
}

/// Strategy for generating member names, some without a serial.
fn member_name() -> impl Strategy<Value = String> {
    prop_oneof![
        (0..1000u32).prop_map(|n| format!("pg-{}", n)),
        "[a-z]{1,6}(-[0-9]{1,3})?",
    ]
}

/// Strategy for generating random phases.
fn any_phase() -> impl Strategy<Value = ClusterPhase> {
    prop_oneof![
        Just(ClusterPhase::Pending),
        Just(ClusterPhase::Converged),
        Just(ClusterPhase::ScalingDown),
        Just(ClusterPhase::ReplacingFollower),
        Just(ClusterPhase::AwaitingManualSwitchover),
        Just(ClusterPhase::AutoSwitchoverInitiated),
        Just(ClusterPhase::ReplacingPrimary),
    ]
}

/// Strategy for generating random events.
fn any_event() -> impl Strategy<Value = RolloutEvent> {
    prop_oneof![
        Just(RolloutEvent::SurplusMember),
        Just(RolloutEvent::FollowerStale),
        Just(RolloutEvent::PrimaryStale),
        Just(RolloutEvent::SwitchoverDesignated),
        Just(RolloutEvent::HandoffCompleted),
        Just(RolloutEvent::AllCurrent),
    ]
}

fn members(serials: &[u32], stale: &[bool]) -> Vec<Member> {
    serials
        .iter()
        .zip(stale.iter().cycle())
        .map(|(serial, &stale)| {
            Member::new(format!("pg-{}", serial), "default")
                .with_image(if stale { OLD } else { NEW })
                .with_address("10.0.0.1")
        })
        .collect()
}

fn statuses(members: &[Member], primary: &str) -> ClusterStatusSnapshot {
    let statuses = members
        .iter()
        .enumerate()
        .map(|(i, m)| {
            if m.name == primary {
                ReplicationStatus::primary(m.name.clone(), SYSTEM_ID)
            } else {
                let lsn = Some(Lsn(100 * i as u64));
                ReplicationStatus::follower(m.name.clone(), SYSTEM_ID, lsn, lsn)
            }
        })
        .collect();
    ClusterStatusSnapshot::new(statuses, Vec::new())
}

proptest! {
    /// Property: At or below target, scale-down plans nothing.
    #[test]
    fn test_scale_down_noop_at_or_below_target(
        serials in serials(),
        extra in 0..5i32,
        persistent in any::<bool>(),
    ) {
        let members = members(&serials, &[false]);
        let instances = members.len() as i32 + extra;
        let cluster = view(instances, persistent, PrimaryUpdateStrategy::Unsupervised);
        prop_assert!(plan_scale_down(&cluster, &members).is_none());
    }

    /// Property: Above target, scale-down removes exactly the maximum member by
    /// name order, with its storage exactly when storage is durable.
    #[test]
    fn test_scale_down_removes_maximum(
        serials in serials(),
        deficit in 1..5i32,
        persistent in any::<bool>(),
    ) {
        let members = members(&serials, &[false]);
        let instances = (members.len() as i32 - deficit).max(0);
        prop_assume!((members.len() as i32) > instances);
        let cluster = view(instances, persistent, PrimaryUpdateStrategy::Unsupervised);

        let max = serials.iter().max().unwrap();
        prop_assert_eq!(
            plan_scale_down(&cluster, &members),
            Some(Intent::RemoveMember {
                name: format!("pg-{}", max),
                delete_storage: persistent,
            })
        );
    }

    /// Property: The upgrade never removes the primary, and a stale follower
    /// is the first stale non-primary member in descending name order.
    #[test]
    fn test_upgrade_never_removes_primary(
        serials in serials(),
        stale in prop::collection::vec(any::<bool>(), 1..8),
        primary_index in any::<prop::sample::Index>(),
        supervised in any::<bool>(),
    ) {
        let members = members(&serials, &stale);
        let primary = primary_index.get(&members).name.clone();
        let strategy = if supervised {
            PrimaryUpdateStrategy::Supervised
        } else {
            PrimaryUpdateStrategy::Unsupervised
        };
        let mut cluster = view(members.len() as i32, false, strategy);
        cluster.current_primary = Some(primary.clone());
        cluster.target_primary = Some(primary.clone());
        let snapshot = statuses(&members, &primary);

        let primary_stale = members
            .iter()
            .any(|m| m.name == primary && m.image.as_deref() == Some(OLD));
        let expected = sorted_descending(&members)
            .into_iter()
            .find(|m| m.name != primary && m.image.as_deref() == Some(OLD))
            .map(|m| m.name.clone());

        let plan = match plan_upgrade(&cluster, &members, &snapshot) {
            Ok(plan) => plan,
            Err(e) => {
                // Only a lone stale primary leaves nothing to promote
                prop_assert!(
                    expected.is_none() && primary_stale && !supervised && members.len() < 2,
                    "{}",
                    e
                );
                return Ok(());
            }
        };

        match (&plan.intent, expected) {
            (Some(Intent::RemoveMember { name, delete_storage }), Some(expected)) => {
                prop_assert_eq!(name, &expected);
                prop_assert!(!delete_storage);
            }
            (Some(Intent::RemoveMember { name, .. }), None) => {
                prop_assert!(false, "unexpected removal of {}", name);
            }
            (Some(Intent::DesignatePrimary { name }), None) => {
                prop_assert!(!supervised);
                prop_assert_ne!(name, &primary);
            }
            (None, None) => {
                if primary_stale {
                    prop_assert!(supervised);
                } else {
                    prop_assert_eq!(plan.state, ClusterPhase::Converged);
                }
            }
            (intent, Some(expected)) => {
                prop_assert!(false, "expected removal of {}, got {:?}", expected, intent);
            }
        }
    }

    /// Property: Member name order is a total order consistent with equality.
    #[test]
    fn test_member_name_order_total(
        a in member_name(),
        b in member_name(),
        c in member_name(),
    ) {
        prop_assert_eq!(member_name_order(&a, &b), member_name_order(&b, &a).reverse());
        prop_assert_eq!(member_name_order(&a, &b) == Ordering::Equal, a == b);
        if member_name_order(&a, &b) != Ordering::Greater
            && member_name_order(&b, &c) != Ordering::Greater
        {
            prop_assert_ne!(member_name_order(&a, &c), Ordering::Greater);
        }
    }

    /// Property: Numeric serials order by value, not by text.
    #[test]
    fn test_serials_order_numerically(x in 0..100_000u64, y in 0..100_000u64) {
        let order = member_name_order(&format!("pg-{}", x), &format!("pg-{}", y));
        prop_assert_eq!(order, x.cmp(&y));
    }

    /// Property: Descending order does not depend on arrival order.
    #[test]
    fn test_sorted_descending_stable_under_shuffle(serials in serials()) {
        let members = members(&serials, &[false]);
        let mut reversed = members.clone();
        reversed.reverse();

        let a: Vec<&str> = sorted_descending(&members).iter().map(|m| m.name.as_str()).collect();
        let b: Vec<&str> = sorted_descending(&reversed).iter().map(|m| m.name.as_str()).collect();
        prop_assert_eq!(&a, &b);

        let unique: BTreeSet<&str> = a.iter().copied().collect();
        prop_assert_eq!(unique.len(), a.len());
    }

    /// Property: State machine lookups are deterministic.
    #[test]
    fn test_state_transitions_deterministic(phase in any_phase(), event in any_event()) {
        let sm = RolloutStateMachine::new();
        let first = sm.transition(phase, event).map(|t| t.to);
        let second = sm.transition(phase, event).map(|t| t.to);
        prop_assert_eq!(first, second);
    }

    /// Property: Every phase can move to ScalingDown on a surplus member.
    #[test]
    fn test_all_can_scale_down(phase in any_phase()) {
        let sm = RolloutStateMachine::new();
        prop_assert!(sm.can_transition(phase, ClusterPhase::ScalingDown));
    }

    /// Property: Phase can be serialized and deserialized.
    #[test]
    fn test_phase_roundtrip(phase in any_phase()) {
        let serialized = serde_json::to_string(&phase).unwrap();
        let deserialized: ClusterPhase = serde_json::from_str(&serialized).unwrap();
        prop_assert_eq!(phase, deserialized);
    }
}
