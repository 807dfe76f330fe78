//! Replication status snapshot of a cluster.
//!
//! Every member is probed concurrently; members whose probe fails are
//! recorded as unreachable instead of failing the whole snapshot. The primary
//! bookkeeping fields are reconciled against what the members report.

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ClusterStatusSnapshot, ProbeError, StatusProbe};
use crate::controller::error::{Error, Result};
use crate::controller::members::{ClusterView, Member};
use crate::controller::store::PrimaryStatusUpdate;

/// Probe every member and rank the answers.
///
/// Fails only when the cycle is cancelled; individual probe failures land in
/// `unreachable`.
pub async fn take_snapshot<P: StatusProbe>(
    prober: &P,
    cluster: &ClusterView,
    members: &[Member],
    cancel: &CancellationToken,
) -> Result<ClusterStatusSnapshot> {
    let probes = members.iter().map(|member| {
        let target = member.probe_target(cluster.postgres_port);
        async move { prober.read_status(&target, cancel).await }
    });
    let results = join_all(probes).await;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut statuses = Vec::with_capacity(results.len());
    let mut unreachable = Vec::new();
    for result in results {
        match result {
            Ok(status) => statuses.push(status),
            Err(ProbeError::Cancelled(_)) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(
                    name = %cluster.name,
                    namespace = %cluster.namespace,
                    pod = %e.member(),
                    error = %e,
                    "Member status unknown"
                );
                unreachable.push(e.member().to_string());
            }
        }
    }

    let snapshot = ClusterStatusSnapshot::new(statuses, unreachable);
    if !snapshot.foreign.is_empty() {
        warn!(
            name = %cluster.name,
            foreign = ?snapshot.foreign.iter().map(|s| s.member_name.as_str()).collect::<Vec<_>>(),
            "Members report a different system identifier than the primary"
        );
    }
    debug!(
        name = %cluster.name,
        reachable = snapshot.len(),
        unreachable = snapshot.unreachable.len(),
        primaries = snapshot.primary_count(),
        "Status snapshot taken"
    );
    Ok(snapshot)
}

/// Number of members answering the liveness ping.
pub async fn count_reachable<P: StatusProbe>(
    prober: &P,
    cluster: &ClusterView,
    members: &[Member],
    cancel: &CancellationToken,
) -> Result<usize> {
    let pings = members.iter().map(|member| {
        let target = member.probe_target(cluster.postgres_port);
        async move { prober.check_reachable(&target, cancel).await }
    });
    let results = join_all(pings).await;

    let mut reachable = 0;
    for result in results {
        match result {
            Ok(()) => reachable += 1,
            Err(ProbeError::Cancelled(_)) => return Err(Error::Cancelled),
            Err(e) => {
                debug!(name = %cluster.name, pod = %e.member(), error = %e, "Member not reachable")
            }
        }
    }
    Ok(reachable)
}

/// Primary bookkeeping implied by a snapshot, if it differs from the cluster.
///
/// With no `currentPrimary` recorded, a sole reported primary is adopted.
/// When a designated `targetPrimary` is the sole reported primary, the
/// handoff is confirmed by moving `currentPrimary` to it. A primary switched
/// by hand is adopted only once the recorded primary answers as a follower.
/// Nothing is inferred while zero or several members claim to be primary.
pub fn observe_primary(
    cluster: &ClusterView,
    snapshot: &ClusterStatusSnapshot,
) -> Option<PrimaryStatusUpdate> {
    if snapshot.primary_count() != 1 {
        return None;
    }
    let reported = snapshot.primary()?.member_name.as_str();

    match (cluster.current_primary.as_deref(), cluster.target_primary.as_deref()) {
        (None, None) => Some(PrimaryStatusUpdate::observed(reported)),
        (None, Some(target)) if target == reported => Some(PrimaryStatusUpdate::observed(reported)),
        (Some(current), _) if current == reported => None,
        (Some(_), Some(target)) if target == reported => {
            Some(PrimaryStatusUpdate::observed(reported))
        }
        (Some(current), _) => {
            let demoted = snapshot
                .items
                .iter()
                .any(|s| s.member_name == current && !s.is_primary);
            demoted.then(|| PrimaryStatusUpdate::observed(reported))
        }
        (None, Some(_)) => None,
    }
}
