//! Access to the declarative object store.
//!
//! `ClusterStore` is the seam between the decision logic and the Kubernetes
//! API: listing members, deleting members and their storage claims, and
//! writing the primary bookkeeping fields under optimistic concurrency.
//! `KubeClusterStore` is the implementation used by the running operator.

use std::future::Future;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, Patch, PatchParams},
};
use tracing::{debug, info};

use crate::controller::common::{is_conflict, is_not_found};
use crate::controller::error::{Error, ObjectKind, Result};
use crate::controller::members::{ClusterView, Member, member_name_order};
use crate::crd::{CLUSTER_LABEL, PostgresCluster};

/// Field manager name for status patches.
pub const FIELD_MANAGER: &str = "pgcluster-operator";

/// Primary bookkeeping fields to write. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryStatusUpdate {
    pub current_primary: Option<String>,
    pub target_primary: Option<String>,
}

impl PrimaryStatusUpdate {
    /// Designate a new primary.
    pub fn designate(target: impl Into<String>) -> Self {
        Self {
            current_primary: None,
            target_primary: Some(target.into()),
        }
    }

    /// Record the member that is observed to be primary.
    pub fn observed(primary: impl Into<String>) -> Self {
        let primary = primary.into();
        Self {
            current_primary: Some(primary.clone()),
            target_primary: Some(primary),
        }
    }

    /// JSON merge patch carrying the resource version precondition.
    pub fn to_patch(&self, resource_version: Option<&str>) -> serde_json::Value {
        let mut status = serde_json::Map::new();
        if let Some(current) = &self.current_primary {
            status.insert("currentPrimary".to_string(), current.clone().into());
        }
        if let Some(target) = &self.target_primary {
            status.insert("targetPrimary".to_string(), target.clone().into());
        }

        let mut patch = serde_json::json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }
        patch
    }
}

/// Operations the controllers issue against the object store.
pub trait ClusterStore {
    /// Live members of a cluster, ordered by name.
    fn list_members(
        &self,
        cluster: &ClusterView,
    ) -> impl Future<Output = Result<Vec<Member>>> + Send;

    /// Delete a member. Already-deleted members count as success.
    fn delete_member(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete the storage claim named `name`. Already-deleted claims count as
    /// success.
    fn delete_storage_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Write primary bookkeeping fields, failing with `Error::Conflict` if the
    /// cluster changed since `cluster` was read.
    fn update_primary_status(
        &self,
        cluster: &ClusterView,
        update: &PrimaryStatusUpdate,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// `ClusterStore` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ClusterStore for KubeClusterStore {
    async fn list_members(&self, cluster: &ClusterView) -> Result<Vec<Member>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let selector = format!("{}={}", CLUSTER_LABEL, cluster.name);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;

        let mut members: Vec<Member> = list
            .items
            .iter()
            // Terminating pods are already on their way out
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .map(Member::from_pod)
            .collect();
        members.sort_by(|a, b| member_name_order(&a.name, &b.name));

        debug!(
            name = %cluster.name,
            namespace = %cluster.namespace,
            members = members.len(),
            "Listed cluster members"
        );
        Ok(members)
    }

    async fn delete_member(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %name, namespace = %namespace, "Member deletion requested");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(pod = %name, "Member already deleted");
                Ok(())
            }
            Err(source) => Err(Error::Delete {
                kind: ObjectKind::Member,
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn delete_storage_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match claims.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pvc = %name, namespace = %namespace, "Storage claim deletion requested");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(pvc = %name, "Storage claim already deleted");
                Ok(())
            }
            Err(source) => Err(Error::Delete {
                kind: ObjectKind::StorageClaim,
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn update_primary_status(
        &self,
        cluster: &ClusterView,
        update: &PrimaryStatusUpdate,
    ) -> Result<()> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let patch = update.to_patch(cluster.resource_version.as_deref());

        match api
            .patch_status(
                &cluster.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Err(Error::Conflict(format!(
                "cluster {}/{} changed since resourceVersion {}",
                cluster.namespace,
                cluster.name,
                cluster.resource_version.as_deref().unwrap_or("<none>")
            ))),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
