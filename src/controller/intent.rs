//! Side-effect intents emitted by the decision functions.
//!
//! Scale-down and upgrade planning are pure: they return an [`Intent`] that
//! says what should change. [`execute`] carries it out against a
//! [`ClusterStore`], honoring the ordering rules (member before storage,
//! designation without any delete).

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::controller::common::cancellable;
use crate::controller::error::{Error, Result};
use crate::controller::members::ClusterView;
use crate::controller::store::{ClusterStore, PrimaryStatusUpdate};

/// A change the controllers want applied to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Delete a member. External provisioning recreates it (upgrade) or not
    /// (scale-down). Its storage claim is deleted too when `delete_storage`.
    RemoveMember { name: String, delete_storage: bool },
    /// Record `name` as the target primary to start a switchover.
    DesignatePrimary { name: String },
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::RemoveMember {
                name,
                delete_storage: true,
            } => write!(f, "remove member {} and its storage", name),
            Intent::RemoveMember { name, .. } => write!(f, "remove member {}", name),
            Intent::DesignatePrimary { name } => write!(f, "designate {} as primary", name),
        }
    }
}

/// What [`execute`] actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    /// The member delete was issued, and the claim delete when requested.
    MemberRemoved { name: String, storage_deleted: bool },
    /// The target primary was recorded.
    PrimaryDesignated { name: String },
}

/// Apply an intent.
///
/// For `RemoveMember` the member is deleted first; a failure there aborts
/// before storage is touched. A claim delete failing after the member delete
/// succeeded is reported as `Error::StorageCleanup`.
pub async fn execute<S: ClusterStore>(
    store: &S,
    cluster: &ClusterView,
    intent: &Intent,
    cancel: &CancellationToken,
) -> Result<IntentOutcome> {
    match intent {
        Intent::RemoveMember {
            name,
            delete_storage,
        } => {
            if let Err(e) =
                cancellable(cancel, store.delete_member(&cluster.namespace, name)).await
            {
                error!(
                    cluster = %cluster.name,
                    namespace = %cluster.namespace,
                    pod = %name,
                    error = %e,
                    "Cannot delete member"
                );
                return Err(e);
            }

            if !delete_storage {
                return Ok(IntentOutcome::MemberRemoved {
                    name: name.clone(),
                    storage_deleted: false,
                });
            }

            match cancellable(cancel, store.delete_storage_claim(&cluster.namespace, name)).await
            {
                Ok(()) => Ok(IntentOutcome::MemberRemoved {
                    name: name.clone(),
                    storage_deleted: true,
                }),
                Err(Error::Delete { source, .. }) => {
                    warn!(
                        cluster = %cluster.name,
                        pvc = %name,
                        error = %source,
                        "Member deleted but storage claim was not"
                    );
                    Err(Error::StorageCleanup {
                        member: name.clone(),
                        source,
                    })
                }
                Err(e) => {
                    warn!(
                        cluster = %cluster.name,
                        pvc = %name,
                        error = %e,
                        "Storage claim cleanup interrupted after member deletion"
                    );
                    Err(e)
                }
            }
        }
        Intent::DesignatePrimary { name } => {
            let update = PrimaryStatusUpdate::designate(name.clone());
            cancellable(cancel, store.update_primary_status(cluster, &update)).await?;
            info!(
                cluster = %cluster.name,
                namespace = %cluster.namespace,
                target_primary = %name,
                "Target primary recorded"
            );
            Ok(IntentOutcome::PrimaryDesignated { name: name.clone() })
        }
    }
}
