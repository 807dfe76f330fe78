//! Scale-down scenarios against the recording store.

use pgcluster_operator::controller::cluster_scale::{ScaleDownOutcome, scale_down};
use pgcluster_operator::controller::cluster_status::count_reachable;
use pgcluster_operator::controller::error::Error;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{PostgresClusterBuilder, follower, member, members_on, primary};
use crate::{MockClusterStore, MockProber, StoreCall};

#[tokio::test]
async fn test_scale_down_at_target_is_noop() {
    let view = PostgresClusterBuilder::new("pg").instances(3).view();
    let members = members_on(3, "postgres:17");
    let store = MockClusterStore::new(members.clone());

    let outcome = scale_down(&store, &view, &members, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ScaleDownOutcome::NothingToDo);
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_scale_down_below_target_is_noop() {
    let view = PostgresClusterBuilder::new("pg").instances(5).view();
    let members = members_on(2, "postgres:17");
    let store = MockClusterStore::new(members.clone());

    let outcome = scale_down(&store, &view, &members, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ScaleDownOutcome::NothingToDo);
    assert!(store.member_deletes().is_empty());
}

#[tokio::test]
async fn test_scale_down_removes_highest_member_only() {
    let view = PostgresClusterBuilder::new("pg").instances(2).view();
    let members = vec![
        member("pg-10", "postgres:17"),
        member("pg-2", "postgres:17"),
        member("pg-9", "postgres:17"),
        member("pg-1", "postgres:17"),
    ];
    let store = MockClusterStore::new(members.clone());

    let outcome = scale_down(&store, &view, &members, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ScaleDownOutcome::Removed {
            name: "pg-10".to_string(),
            storage_deleted: false,
        }
    );
    assert_eq!(store.member_deletes(), vec!["pg-10"]);
}

#[tokio::test]
async fn test_scale_down_without_durable_storage_keeps_claims() {
    let view = PostgresClusterBuilder::new("pg").instances(1).view();
    let members = members_on(2, "postgres:17");
    let store = MockClusterStore::new(members.clone());

    scale_down(&store, &view, &members, &CancellationToken::new())
        .await
        .unwrap();

    assert!(store.claim_deletes().is_empty());
}

#[tokio::test]
async fn test_scale_down_deletes_claim_after_member() {
    let view = PostgresClusterBuilder::new("pg")
        .instances(2)
        .persistent()
        .view();
    let members = members_on(3, "postgres:17");
    let store = MockClusterStore::new(members.clone());

    let outcome = scale_down(&store, &view, &members, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ScaleDownOutcome::Removed {
            name: "pg-3".to_string(),
            storage_deleted: true,
        }
    );
    assert_eq!(
        store.calls(),
        vec![
            StoreCall::DeleteMember("pg-3".to_string()),
            StoreCall::DeleteStorageClaim("pg-3".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_failed_member_delete_leaves_storage_alone() {
    let view = PostgresClusterBuilder::new("pg")
        .instances(2)
        .persistent()
        .view();
    let members = members_on(3, "postgres:17");
    let store = MockClusterStore::new(members.clone()).fail_member_delete("pg-3");

    let err = scale_down(&store, &view, &members, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Delete { ref name, .. } if name == "pg-3"));
    assert!(err.is_retryable());
    assert!(store.claim_deletes().is_empty());
}

#[tokio::test]
async fn test_failed_claim_delete_is_reported_as_storage_cleanup() {
    let view = PostgresClusterBuilder::new("pg")
        .instances(2)
        .persistent()
        .view();
    let members = members_on(3, "postgres:17");
    let store = MockClusterStore::new(members.clone()).fail_claim_delete("pg-3");

    let err = scale_down(&store, &view, &members, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::StorageCleanup { ref member, .. } if member == "pg-3"));
    assert!(err.is_retryable());
    // The member itself is gone
    assert!(store.members().iter().all(|m| m.name != "pg-3"));
}

#[tokio::test]
async fn test_scale_down_converges_over_cycles() {
    let view = PostgresClusterBuilder::new("pg").instances(2).view();
    let store = MockClusterStore::new(members_on(5, "postgres:17"));
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        let members = store.members();
        scale_down(&store, &view, &members, &cancel).await.unwrap();
    }

    assert_eq!(store.member_deletes(), vec!["pg-5", "pg-4", "pg-3"]);
    let remaining: Vec<String> = store.members().into_iter().map(|m| m.name).collect();
    assert_eq!(remaining, vec!["pg-1", "pg-2"]);
}

#[tokio::test]
async fn test_cancelled_scale_down_issues_no_delete() {
    let view = PostgresClusterBuilder::new("pg").instances(1).view();
    let members = members_on(3, "postgres:17");
    let store = MockClusterStore::new(members.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = scale_down(&store, &view, &members, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_ready_count_only_covers_answering_survivors() {
    let view = PostgresClusterBuilder::new("pg").instances(2).view();
    let members = members_on(3, "postgres:17");
    let store = MockClusterStore::new(members.clone());
    // pg-2 never answers; pg-3 answers but is the member being removed
    let prober = MockProber::new(vec![primary("pg-1"), follower("pg-3", 100)]);
    let cancel = CancellationToken::new();

    let outcome = scale_down(&store, &view, &members, &cancel).await.unwrap();
    let remaining = outcome.remaining(&members);
    let ready = count_reachable(&prober, &view, &remaining, &cancel)
        .await
        .unwrap();

    assert_eq!(remaining.len(), 2);
    assert_eq!(ready, 1);
}
