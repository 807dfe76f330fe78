//! Cluster members and the ordering helpers shared by the scale-down and
//! rolling upgrade controllers.
//!
//! Decision functions never look at Kubernetes objects directly. They work on
//! a [`ClusterView`] (desired state plus the primary bookkeeping fields) and a
//! list of [`Member`]s, both built here from the watched objects.

use std::cmp::Ordering;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::client::ProbeTarget;
use crate::crd::{ClusterPhase, POSTGRES_CONTAINER_NAME, PostgresCluster, PrimaryUpdateStrategy};

/// One running database member (a Pod).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Pod name; also the name of its storage claim.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Image of the `postgres` container, `None` if the Pod has no such container.
    pub image: Option<String>,
    /// Pod IP, once assigned.
    pub address: Option<String>,
}

impl Member {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: None,
            address: None,
        }
    }

    /// Set the running image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the Pod address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Build a member from its Pod.
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            name: pod.name_any(),
            namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
            image: postgres_image(pod),
            address: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        }
    }

    /// Where to reach this member's engine.
    pub fn probe_target(&self, port: u16) -> ProbeTarget {
        ProbeTarget::new(self.name.clone(), self.address.clone(), port)
    }

    /// Whether the member runs an image other than `target`. Unknown images
    /// are not considered stale.
    pub fn is_stale(&self, target: &str) -> bool {
        self.image.as_deref().is_some_and(|image| image != target)
    }
}

/// Image of the engine container in a Pod.
pub fn postgres_image(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == POSTGRES_CONTAINER_NAME)
        .and_then(|c| c.image.clone())
}

/// Total order over member names.
///
/// Names are compared by their prefix, then by the numeric value of a
/// trailing serial (`pg-10` sorts after `pg-9`), then as plain strings. For
/// names without a serial this is plain string order.
pub fn member_name_order(a: &str, b: &str) -> Ordering {
    let (a_prefix, a_serial) = split_serial(a);
    let (b_prefix, b_serial) = split_serial(b);
    a_prefix
        .cmp(b_prefix)
        .then_with(|| a_serial.cmp(&b_serial))
        .then_with(|| a.cmp(b))
}

fn split_serial(name: &str) -> (&str, Option<u64>) {
    let digits = name.bytes().rev().take_while(u8::is_ascii_digit).count();
    let (prefix, serial) = name.split_at(name.len() - digits);
    (prefix, serial.parse().ok())
}

/// Members ordered by name, highest first.
pub fn sorted_descending(members: &[Member]) -> Vec<&Member> {
    let mut sorted: Vec<&Member> = members.iter().collect();
    sorted.sort_by(|a, b| member_name_order(&b.name, &a.name));
    sorted
}

/// The member to remove on scale-down: the highest by name, i.e. the most
/// recently added one.
pub fn sacrificial_member(members: &[Member]) -> Option<&Member> {
    members
        .iter()
        .max_by(|a, b| member_name_order(&a.name, &b.name))
}

/// Desired state and primary bookkeeping of one cluster, as the decision
/// functions see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// Name of the cluster.
    pub name: String,
    /// Namespace of the cluster.
    pub namespace: String,
    /// Target image.
    pub image_name: String,
    /// Target member count.
    pub instances: i32,
    /// Primary update strategy.
    pub update_strategy: PrimaryUpdateStrategy,
    /// Whether members own a storage claim.
    pub uses_persistent_storage: bool,
    /// Member currently believed to be primary.
    pub current_primary: Option<String>,
    /// Member designated to become primary.
    pub target_primary: Option<String>,
    /// Phase recorded by the previous cycle.
    pub phase: ClusterPhase,
    /// Engine port.
    pub postgres_port: u16,
    /// Resource version the view was read at, for optimistic updates.
    pub resource_version: Option<String>,
    /// Generation the view was read at.
    pub generation: Option<i64>,
}

impl ClusterView {
    pub fn from_resource(cluster: &PostgresCluster) -> Self {
        Self {
            name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_else(|| "default".to_string()),
            image_name: cluster.image_name().to_string(),
            instances: cluster.spec.instances,
            update_strategy: cluster.primary_update_strategy(),
            uses_persistent_storage: cluster.uses_persistent_storage(),
            current_primary: cluster.current_primary().map(str::to_string),
            target_primary: cluster.target_primary().map(str::to_string),
            phase: cluster.phase(),
            postgres_port: cluster.spec.postgres_port,
            resource_version: cluster.resource_version(),
            generation: cluster.metadata.generation,
        }
    }

    /// Whether `member` was designated by a switchover that has not
    /// completed yet.
    pub fn is_pending_target(&self, member: &str) -> bool {
        self.switchover_pending() && self.target_primary.as_deref() == Some(member)
    }

    /// Whether a switchover was designated but has not completed yet.
    pub fn switchover_pending(&self) -> bool {
        match (&self.target_primary, &self.current_primary) {
            (Some(target), Some(current)) => target != current,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Whether there are more members than the target count.
    pub fn is_over_target(&self, observed: usize) -> bool {
        i64::try_from(observed).unwrap_or(i64::MAX) > i64::from(self.instances)
    }
}
