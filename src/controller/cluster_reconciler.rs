//! Reconciliation loop for PostgresCluster.
//!
//! One cycle lists the members of a cluster and then runs exactly one of the
//! lifecycle paths: scale-down when there are more members than requested,
//! otherwise the rolling upgrade. The replication snapshot is only taken
//! when a decision depends on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ClusterStatusSnapshot;
use crate::controller::{
    cluster_scale::{ScaleDownOutcome, scale_down},
    cluster_status::{count_reachable, observe_primary, take_snapshot},
    cluster_upgrade::{UpgradePlan, upgrade},
    common::cancellable,
    context::Context,
    error::Error,
    intent::Intent,
    members::{ClusterView, Member},
    status::ConditionBuilder,
    store::{ClusterStore, FIELD_MANAGER},
    upgrade_state_machine::{RolloutEvent, RolloutStateMachine, TransitionResult},
};
use crate::crd::{ClusterPhase, PostgresCluster, SnapshotSummary};
use crate::health::DeletionReason;

/// What one cycle observed and decided, for the status update.
#[derive(Debug)]
struct CycleOutcome {
    phase: ClusterPhase,
    event: RolloutEvent,
    members: usize,
    ready: usize,
    snapshot: Option<ClusterStatusSnapshot>,
}

/// Reconcile a PostgresCluster
pub async fn reconcile(obj: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling PostgresCluster");

    if obj.metadata.deletion_timestamp.is_some() {
        // Members are garbage collected through their owner references
        debug!(name = %name, "Cluster is being deleted");
        if let Some(ref health_state) = ctx.health_state {
            health_state
                .metrics
                .record_cluster_phase(&namespace, &name, None);
        }
        return Ok(Action::await_change());
    }

    let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    if let Err(e) = validate_spec(&obj) {
        error!(name = %name, error = %e, "Validation failed");
        ctx.publish_warning_event(&obj, "ValidationFailed", "Validating", Some(e.to_string()))
            .await;
        let mut conditions = ConditionBuilder::from_existing(conditions_of(&obj));
        conditions.ready(false, e.reason(), &e.to_string(), obj.metadata.generation);
        patch_status(&api, &name, status_patch_conditions(&obj, conditions)).await?;
        return Err(e);
    }

    let view = ClusterView::from_resource(&obj);
    let cancel = ctx.shutdown.child_token();

    let members = cancellable(&cancel, ctx.store.list_members(&view)).await?;

    let outcome = if view.is_over_target(members.len()) {
        reconcile_scale_down(&obj, &ctx, &view, &members, &cancel).await?
    } else {
        match reconcile_upgrade(&obj, &ctx, &view, &members, &cancel).await? {
            Some(outcome) => outcome,
            // The primary bookkeeping changed; continue from the new version
            None => return Ok(Action::requeue(Duration::from_secs(1))),
        }
    };

    let state_machine = RolloutStateMachine::new();
    if let TransitionResult::Unexpected { from, to, event } =
        state_machine.check(view.phase, outcome.phase, outcome.event)
    {
        warn!(
            name = %name,
            from = %from,
            to = %to,
            event = %event,
            "Unexpected phase transition, recording observed phase"
        );
    }

    if outcome.phase != view.phase {
        info!(name = %name, from = %view.phase, to = %outcome.phase, "Phase changed");
    }

    update_status(&api, &obj, &outcome).await?;

    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
        health_state.metrics.record_cluster_phase(
            &namespace,
            &name,
            Some(&outcome.phase.to_string()),
        );
        health_state.mark_reconciled();
        health_state.metrics.set_cluster_instances(
            &namespace,
            &name,
            i64::from(view.instances),
            i64::try_from(outcome.ready).unwrap_or(i64::MAX),
        );
        if let Some(snapshot) = &outcome.snapshot
            && !snapshot.unreachable.is_empty()
        {
            health_state.metrics.record_probe_failures(
                &namespace,
                &name,
                u64::try_from(snapshot.unreachable.len()).unwrap_or(u64::MAX),
            );
        }
    }

    Ok(Action::requeue(requeue_interval(outcome.phase)))
}

/// Remove one surplus member.
async fn reconcile_scale_down(
    obj: &PostgresCluster,
    ctx: &Context,
    view: &ClusterView,
    members: &[Member],
    cancel: &CancellationToken,
) -> Result<CycleOutcome, Error> {
    let outcome = match scale_down(&ctx.store, view, members, cancel).await {
        Err(e @ Error::StorageCleanup { .. }) => {
            record_deletion(ctx, view, DeletionReason::ScaleDown);
            ctx.publish_warning_event(
                obj,
                "StorageCleanupFailed",
                "DeleteStorageClaim",
                Some(e.to_string()),
            )
            .await;
            return Err(e);
        }
        result => result?,
    };

    if let ScaleDownOutcome::Removed {
        name: member,
        storage_deleted,
    } = &outcome
    {
        ctx.publish_normal_event(
            obj,
            "ScaledDown",
            "DeleteMember",
            Some(if *storage_deleted {
                format!("Removed member {} and its storage claim", member)
            } else {
                format!("Removed member {}", member)
            }),
        )
        .await;
        record_deletion(ctx, view, DeletionReason::ScaleDown);
    }

    let remaining = outcome.remaining(members);
    let ready = count_reachable(&ctx.prober, view, &remaining, cancel).await?;
    Ok(CycleOutcome {
        phase: ClusterPhase::ScalingDown,
        event: RolloutEvent::SurplusMember,
        members: remaining.len(),
        ready,
        snapshot: None,
    })
}

/// Run one rolling upgrade step.
///
/// Returns `None` when the primary bookkeeping was corrected from the
/// snapshot instead; the cycle then restarts on the updated resource.
async fn reconcile_upgrade(
    obj: &PostgresCluster,
    ctx: &Context,
    view: &ClusterView,
    members: &[Member],
    cancel: &CancellationToken,
) -> Result<Option<CycleOutcome>, Error> {
    let needs_snapshot = members.iter().any(|m| m.is_stale(&view.image_name))
        || view.current_primary.is_none()
        || view.switchover_pending();

    let (snapshot, ready) = if needs_snapshot {
        let snapshot = take_snapshot(&ctx.prober, view, members, cancel).await?;

        if let Some(update) = observe_primary(view, &snapshot) {
            cancellable(cancel, ctx.store.update_primary_status(view, &update)).await?;
            info!(
                name = %view.name,
                current_primary = ?update.current_primary,
                "Primary observed"
            );
            return Ok(None);
        }

        let ready = snapshot.len();
        (snapshot, ready)
    } else {
        let ready = count_reachable(&ctx.prober, view, members, cancel).await?;
        (ClusterStatusSnapshot::default(), ready)
    };

    let plan = match upgrade(&ctx.store, view, members, &snapshot, cancel).await {
        Ok(plan) => plan,
        Err(e @ Error::InconsistentClusterStatus(_)) => {
            ctx.publish_warning_event(
                obj,
                "InconsistentClusterStatus",
                "Upgrade",
                Some(e.to_string()),
            )
            .await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    publish_plan_events(obj, ctx, view, &plan).await;

    Ok(Some(CycleOutcome {
        phase: plan.state,
        event: plan.event,
        members: members.len(),
        ready,
        snapshot: needs_snapshot.then_some(snapshot),
    }))
}

async fn publish_plan_events(
    obj: &PostgresCluster,
    ctx: &Context,
    view: &ClusterView,
    plan: &UpgradePlan,
) {
    match &plan.intent {
        Some(Intent::RemoveMember { name, .. }) => {
            ctx.publish_normal_event(
                obj,
                "MemberReplaced",
                "Upgrade",
                Some(format!(
                    "Deleted member {} to recreate it on image {}",
                    name, view.image_name
                )),
            )
            .await;
            record_deletion(ctx, view, DeletionReason::Upgrade);
        }
        Some(Intent::DesignatePrimary { name }) => {
            ctx.publish_normal_event(
                obj,
                "SwitchoverInitiated",
                "Upgrade",
                Some(format!("Designated {} as the new primary", name)),
            )
            .await;
            if let Some(ref health_state) = ctx.health_state {
                health_state
                    .metrics
                    .record_switchover(&view.namespace, &view.name);
            }
        }
        None if plan.state == ClusterPhase::AwaitingManualSwitchover
            && view.phase != ClusterPhase::AwaitingManualSwitchover =>
        {
            ctx.publish_normal_event(
                obj,
                "AwaitingSwitchover",
                "Upgrade",
                Some(
                    "The primary runs a stale image; a manual switchover is required".to_string(),
                ),
            )
            .await;
        }
        None => {}
    }
}

fn record_deletion(ctx: &Context, view: &ClusterView, reason: DeletionReason) {
    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_member_deleted(&view.namespace, &view.name, reason);
    }
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if matches!(error, Error::Cancelled) {
        debug!(name = %name, "Reconciliation cancelled");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(Duration::from_secs(300))
    }
}

/// Validate the cluster spec
pub fn validate_spec(obj: &PostgresCluster) -> Result<(), Error> {
    if obj.spec.instances < 1 {
        return Err(Error::Validation("instances must be at least 1".to_string()));
    }
    if obj.spec.image_name.trim().is_empty() {
        return Err(Error::Validation("imageName must not be empty".to_string()));
    }
    if obj.spec.postgres_port == 0 {
        return Err(Error::Validation("postgresPort must not be 0".to_string()));
    }
    if let Some(storage) = &obj.spec.storage
        && storage.size.trim().is_empty()
    {
        return Err(Error::Validation("storage.size must not be empty".to_string()));
    }
    Ok(())
}

/// Requeue interval for the phase a cycle ended in.
pub fn requeue_interval(phase: ClusterPhase) -> Duration {
    match phase {
        ClusterPhase::Converged => Duration::from_secs(60),
        ClusterPhase::ScalingDown
        | ClusterPhase::ReplacingFollower
        | ClusterPhase::ReplacingPrimary => Duration::from_secs(10),
        ClusterPhase::AutoSwitchoverInitiated => Duration::from_secs(5),
        ClusterPhase::AwaitingManualSwitchover | ClusterPhase::Pending => Duration::from_secs(30),
    }
}

fn conditions_of(obj: &PostgresCluster) -> &[crate::crd::Condition] {
    obj.status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default()
}

fn status_patch_conditions(
    obj: &PostgresCluster,
    conditions: ConditionBuilder,
) -> serde_json::Value {
    serde_json::json!({
        "status": {
            "observedGeneration": obj.metadata.generation,
            "conditions": conditions.build(),
        }
    })
}

/// Build the status patch for a finished cycle.
///
/// `currentPrimary` and `targetPrimary` are left out: they are only written
/// through the store under optimistic concurrency.
fn cycle_status_patch(obj: &PostgresCluster, outcome: &CycleOutcome) -> serde_json::Value {
    let generation = obj.metadata.generation;
    let mut conditions = ConditionBuilder::from_existing(conditions_of(obj));

    match outcome.phase {
        ClusterPhase::Converged => {
            conditions.ready(true, "Converged", "All members run the target image", generation);
            conditions.progressing(false, "Converged", "No rollout in progress", generation);
        }
        ClusterPhase::AwaitingManualSwitchover => {
            conditions.ready(
                false,
                "AwaitingManualSwitchover",
                "The primary runs a stale image and needs a manual switchover",
                generation,
            );
            conditions.progressing(false, "AwaitingManualSwitchover", "Waiting", generation);
        }
        phase => {
            let message = format!("Phase: {}", phase);
            conditions.ready(false, "Reconciling", &message, generation);
            conditions.progressing(true, "Reconciling", &message, generation);
        }
    }

    let count = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
    let mut status = serde_json::json!({
        "phase": outcome.phase,
        "instances": count(outcome.members),
        "readyInstances": count(outcome.ready),
        "observedGeneration": generation,
    });

    if let Some(snapshot) = &outcome.snapshot {
        if snapshot.unreachable.is_empty() {
            conditions.degraded(
                false,
                "AllMembersReachable",
                "Every member answered",
                generation,
            );
        } else {
            conditions.degraded(
                true,
                "MembersUnreachable",
                &format!("Unreachable members: {}", snapshot.unreachable.join(", ")),
                generation,
            );
        }
        if snapshot.is_consistent_for_promotion() {
            conditions.replication_consistent(
                true,
                "CandidateAvailable",
                "A follower can be promoted",
                generation,
            );
        } else {
            conditions.replication_consistent(
                false,
                "NoSafeCandidate",
                "The status snapshot cannot drive a promotion",
                generation,
            );
        }
        let summary: SnapshotSummary = snapshot.summary();
        status["lastSnapshot"] = serde_json::json!(summary);
    }

    status["conditions"] = serde_json::json!(conditions.build());
    serde_json::json!({ "status": status })
}

/// Update the status of a PostgresCluster
async fn update_status(
    api: &Api<PostgresCluster>,
    obj: &PostgresCluster,
    outcome: &CycleOutcome,
) -> Result<(), Error> {
    patch_status(api, &obj.name_any(), cycle_status_patch(obj, outcome)).await
}

async fn patch_status(
    api: &Api<PostgresCluster>,
    name: &str,
    patch: serde_json::Value,
) -> Result<(), Error> {
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
