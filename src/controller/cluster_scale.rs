//! Scale-down of surplus members.
//!
//! When more members run than the cluster asks for, exactly one member is
//! removed per reconciliation: the highest by name, so that scale-down undoes
//! growth in reverse order. Its storage claim is deleted with it when the
//! cluster uses persistent storage.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::error::Result;
use crate::controller::intent::{Intent, IntentOutcome, execute};
use crate::controller::members::{ClusterView, Member, sacrificial_member};
use crate::controller::store::ClusterStore;

/// Result of a scale-down attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDownOutcome {
    /// The member count is at or below target.
    NothingToDo,
    /// One member was removed.
    Removed { name: String, storage_deleted: bool },
}

impl ScaleDownOutcome {
    /// Members still running once this outcome has been applied.
    pub fn remaining(&self, members: &[Member]) -> Vec<Member> {
        match self {
            Self::NothingToDo => members.to_vec(),
            Self::Removed { name, .. } => members
                .iter()
                .filter(|member| &member.name != name)
                .cloned()
                .collect(),
        }
    }
}

/// Decide which member, if any, to remove.
pub fn plan_scale_down(cluster: &ClusterView, members: &[Member]) -> Option<Intent> {
    if !cluster.is_over_target(members.len()) {
        return None;
    }

    sacrificial_member(members).map(|member| Intent::RemoveMember {
        name: member.name.clone(),
        delete_storage: cluster.uses_persistent_storage,
    })
}

/// Remove one surplus member.
///
/// Not being over target is a no-op, not an error: the controller is invoked
/// again once a previous deletion has landed.
pub async fn scale_down<S: ClusterStore>(
    store: &S,
    cluster: &ClusterView,
    members: &[Member],
    cancel: &CancellationToken,
) -> Result<ScaleDownOutcome> {
    let Some(intent) = plan_scale_down(cluster, members) else {
        info!(
            name = %cluster.name,
            namespace = %cluster.namespace,
            members = members.len(),
            instances = cluster.instances,
            "No member to remove"
        );
        return Ok(ScaleDownOutcome::NothingToDo);
    };

    info!(
        name = %cluster.name,
        namespace = %cluster.namespace,
        members = members.len(),
        instances = cluster.instances,
        intent = %intent,
        "Scaling down"
    );

    match execute(store, cluster, &intent, cancel).await? {
        IntentOutcome::MemberRemoved {
            name,
            storage_deleted,
        } => Ok(ScaleDownOutcome::Removed {
            name,
            storage_deleted,
        }),
        // plan_scale_down only emits RemoveMember
        IntentOutcome::PrimaryDesignated { .. } => Ok(ScaleDownOutcome::NothingToDo),
    }
}
