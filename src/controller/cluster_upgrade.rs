//! Rolling image upgrade.
//!
//! At most one member is brought onto the target image per reconciliation.
//! Members are scanned by name, highest first, so repeated cycles make
//! monotonic progress. Followers are replaced directly. A stale primary is
//! never deleted while it is primary: it is either left for a manual
//! switchover or a follower is designated to take over, and the old primary
//! is replaced on a later cycle once the handoff has been observed.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::ClusterStatusSnapshot;
use crate::controller::error::{Error, Result};
use crate::controller::intent::{Intent, execute};
use crate::controller::members::{ClusterView, Member, sorted_descending};
use crate::controller::store::ClusterStore;
use crate::controller::upgrade_state_machine::RolloutEvent;
use crate::crd::{ClusterPhase, PrimaryUpdateStrategy};

/// What one upgrade cycle decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePlan {
    /// Phase the cluster is in after this cycle.
    pub state: ClusterPhase,
    /// Event that led to `state`.
    pub event: RolloutEvent,
    /// Side effect to apply, if any.
    pub intent: Option<Intent>,
}

impl UpgradePlan {
    fn new(state: ClusterPhase, event: RolloutEvent, intent: Option<Intent>) -> Self {
        Self {
            state,
            event,
            intent,
        }
    }

    /// Whether the plan waits on a switchover performed outside this cycle.
    pub fn is_waiting(&self) -> bool {
        self.intent.is_none() && self.state.is_switchover()
    }
}

/// Decide the next upgrade step.
///
/// The authoritative member is `currentPrimary`, falling back to the primary
/// reported by the snapshot. With stale members and no known primary the
/// cycle fails with `InconsistentClusterStatus` rather than risk deleting it.
/// A promotion is only chosen when the snapshot's primary is that member.
pub fn plan_upgrade(
    cluster: &ClusterView,
    members: &[Member],
    snapshot: &ClusterStatusSnapshot,
) -> Result<UpgradePlan> {
    let authoritative = cluster
        .current_primary
        .as_deref()
        .or_else(|| snapshot.primary().map(|s| s.member_name.as_str()));

    let mut stale_primary = None;
    let mut stale_target = false;
    for member in sorted_descending(members) {
        let Some(image) = member.image.as_deref() else {
            warn!(
                name = %cluster.name,
                pod = %member.name,
                "Cannot determine the image of member, skipping"
            );
            continue;
        };
        if image == cluster.image_name {
            continue;
        }

        let Some(primary) = authoritative else {
            return Err(Error::InconsistentClusterStatus(format!(
                "member {} is stale but no primary is known",
                member.name
            )));
        };

        if member.name == primary {
            stale_primary = Some(primary);
            continue;
        }

        // The member being promoted stays until the handoff lands
        if cluster.is_pending_target(&member.name) {
            stale_target = true;
            continue;
        }

        // The former primary being replaced once the handoff landed
        let (state, event) = if (cluster.phase.is_switchover() && !cluster.switchover_pending())
            || cluster.phase == ClusterPhase::ReplacingPrimary
        {
            (ClusterPhase::ReplacingPrimary, RolloutEvent::HandoffCompleted)
        } else {
            (ClusterPhase::ReplacingFollower, RolloutEvent::FollowerStale)
        };

        return Ok(UpgradePlan::new(
            state,
            event,
            Some(Intent::RemoveMember {
                name: member.name.clone(),
                delete_storage: false,
            }),
        ));
    }

    if cluster.switchover_pending() && (stale_primary.is_some() || stale_target) {
        let (state, event) = if cluster.phase.is_switchover() {
            (cluster.phase, RolloutEvent::SwitchoverDesignated)
        } else if cluster.update_strategy == PrimaryUpdateStrategy::Supervised {
            (ClusterPhase::AwaitingManualSwitchover, RolloutEvent::PrimaryStale)
        } else {
            (ClusterPhase::AutoSwitchoverInitiated, RolloutEvent::SwitchoverDesignated)
        };
        return Ok(UpgradePlan::new(state, event, None));
    }

    let Some(primary) = stale_primary else {
        return Ok(UpgradePlan::new(
            ClusterPhase::Converged,
            RolloutEvent::AllCurrent,
            None,
        ));
    };

    if cluster.update_strategy == PrimaryUpdateStrategy::Supervised {
        return Ok(UpgradePlan::new(
            ClusterPhase::AwaitingManualSwitchover,
            RolloutEvent::PrimaryStale,
            None,
        ));
    }

    // Ranking is only meaningful relative to the primary we are replacing
    match snapshot.primary() {
        Some(reported) if reported.member_name == primary => {}
        Some(reported) => {
            return Err(Error::InconsistentClusterStatus(format!(
                "member {} reports itself as primary but {} is recorded",
                reported.member_name, primary
            )));
        }
        None => {
            return Err(Error::InconsistentClusterStatus(format!(
                "recorded primary {primary} did not report itself as primary"
            )));
        }
    }

    if !snapshot.is_consistent_for_promotion() {
        return Err(Error::InconsistentClusterStatus(match snapshot.promotion_candidate() {
            Some(candidate) => format!(
                "promotion candidate {} also reports itself as primary",
                candidate.member_name
            ),
            None => format!(
                "need at least 2 members in the status snapshot, have {}",
                snapshot.len()
            ),
        }));
    }

    match snapshot.promotion_candidate() {
        Some(candidate) => Ok(UpgradePlan::new(
            ClusterPhase::AutoSwitchoverInitiated,
            RolloutEvent::SwitchoverDesignated,
            Some(Intent::DesignatePrimary {
                name: candidate.member_name.clone(),
            }),
        )),
        None => Err(Error::InconsistentClusterStatus(
            "no promotion candidate".to_string(),
        )),
    }
}

/// Run one upgrade step: plan it, then apply its intent.
pub async fn upgrade<S: ClusterStore>(
    store: &S,
    cluster: &ClusterView,
    members: &[Member],
    snapshot: &ClusterStatusSnapshot,
    cancel: &CancellationToken,
) -> Result<UpgradePlan> {
    let plan = plan_upgrade(cluster, members, snapshot)?;

    match (&plan.intent, plan.state) {
        (Some(intent), _) => {
            info!(
                name = %cluster.name,
                namespace = %cluster.namespace,
                image = %cluster.image_name,
                phase = %plan.state,
                intent = %intent,
                "Upgrading cluster"
            );
            execute(store, cluster, intent, cancel).await?;
        }
        (None, ClusterPhase::AwaitingManualSwitchover) => {
            info!(
                name = %cluster.name,
                namespace = %cluster.namespace,
                primary = ?cluster.current_primary,
                "Primary runs a stale image, waiting for a manual switchover"
            );
        }
        (None, ClusterPhase::AutoSwitchoverInitiated) => {
            info!(
                name = %cluster.name,
                namespace = %cluster.namespace,
                current_primary = ?cluster.current_primary,
                target_primary = ?cluster.target_primary,
                "Switchover in progress, waiting for the handoff"
            );
        }
        (None, _) => {}
    }

    Ok(plan)
}
