//! PostgresCluster Custom Resource Definition.
//!
//! Declares the desired state of a replicated PostgreSQL cluster: which image
//! every member should run, how many members there should be, and whether the
//! operator may hand primary authority off on its own during a rolling update.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresCluster is a custom resource describing a replicated PostgreSQL cluster.
///
/// Example:
/// ```yaml
/// apiVersion: pgcluster.io/v1alpha1
/// kind: PostgresCluster
/// metadata:
///   name: pg
/// spec:
///   instances: 3
///   imageName: ghcr.io/cloudnative-pg/postgresql:16.4
///   primaryUpdateStrategy: Unsupervised
///   storage:
///     size: 10Gi
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "pgcluster.io",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    status = "PostgresClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyInstances"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Number of members (minimum 1, default 3).
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// Image every member should be running.
    #[serde(default = "default_image_name")]
    pub image_name: String,

    /// How the primary is replaced during a rolling update (default: Unsupervised).
    #[serde(default)]
    pub primary_update_strategy: PrimaryUpdateStrategy,

    /// Durable per-member storage. When absent members use ephemeral storage
    /// and no PersistentVolumeClaims are managed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Port the engine listens on inside each member (default 5432).
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,
}

impl Default for PostgresClusterSpec {
    fn default() -> Self {
        Self {
            instances: default_instances(),
            image_name: default_image_name(),
            primary_update_strategy: PrimaryUpdateStrategy::default(),
            storage: None,
            postgres_port: default_postgres_port(),
        }
    }
}

fn default_instances() -> i32 {
    3
}

fn default_image_name() -> String {
    "ghcr.io/cloudnative-pg/postgresql:16".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

/// Whether replacing the primary during a rolling update is automatic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum PrimaryUpdateStrategy {
    /// The operator switches over to the best follower on its own.
    #[default]
    Unsupervised,
    /// The operator waits for a manually issued switchover.
    Supervised,
}

impl std::fmt::Display for PrimaryUpdateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimaryUpdateStrategy::Unsupervised => write!(f, "Unsupervised"),
            PrimaryUpdateStrategy::Supervised => write!(f, "Supervised"),
        }
    }
}

/// Durable storage configuration. One PersistentVolumeClaim per member,
/// named after the member.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Size of each claim (default: 10Gi).
    #[serde(default = "default_storage_size")]
    pub size: String,

    /// Storage class name. If not set, uses cluster default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
        }
    }
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

impl PostgresCluster {
    /// Image all members should converge on.
    pub fn image_name(&self) -> &str {
        &self.spec.image_name
    }

    /// Whether members own a PersistentVolumeClaim.
    pub fn uses_persistent_storage(&self) -> bool {
        self.spec.storage.is_some()
    }

    pub fn primary_update_strategy(&self) -> PrimaryUpdateStrategy {
        self.spec.primary_update_strategy
    }

    /// Member currently believed to be the primary.
    pub fn current_primary(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.current_primary.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Member designated to become primary during a switchover.
    pub fn target_primary(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.target_primary.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Phase recorded by the last reconciliation.
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

/// Status of a PostgresCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current lifecycle phase.
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Member currently accepting writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    /// Member designated to become primary. Differs from `currentPrimary`
    /// only while a switchover is in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_primary: Option<String>,

    /// Number of members observed.
    #[serde(default)]
    pub instances: i32,

    /// Number of members that answered the last status probe.
    #[serde(default)]
    pub ready_instances: i32,

    /// The generation most recently observed by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Summary of the replication snapshot the last decision was based on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<SnapshotSummary>,
}

/// Compact view of a replication status snapshot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    /// Member reported as primary at index 0, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    /// Best promotion candidate (index 1), if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion_candidate: Option<String>,

    /// Members whose probe failed.
    #[serde(default)]
    pub unreachable: Vec<String>,

    /// Members reporting a different system identifier than the primary.
    #[serde(default)]
    pub foreign: Vec<String>,
}

/// ClusterPhase records where the cluster stands between reconciliations.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ClusterPhase {
    /// Not reconciled yet.
    #[default]
    Pending,
    /// Every member runs the target image and the member count is on target.
    Converged,
    /// A surplus member was removed; waiting for the deletion to land.
    ScalingDown,
    /// A stale follower was deleted and is being recreated on the target image.
    ReplacingFollower,
    /// Only the primary is stale and the update strategy is Supervised.
    AwaitingManualSwitchover,
    /// A follower was designated as the new primary; waiting for the handoff.
    AutoSwitchoverInitiated,
    /// The former primary, now a follower, is being recreated.
    ReplacingPrimary,
}

impl ClusterPhase {
    /// Whether the phase waits on a primary handoff performed outside this cycle.
    pub fn is_switchover(&self) -> bool {
        matches!(
            self,
            ClusterPhase::AwaitingManualSwitchover | ClusterPhase::AutoSwitchoverInitiated
        )
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Converged => write!(f, "Converged"),
            ClusterPhase::ScalingDown => write!(f, "ScalingDown"),
            ClusterPhase::ReplacingFollower => write!(f, "ReplacingFollower"),
            ClusterPhase::AwaitingManualSwitchover => write!(f, "AwaitingManualSwitchover"),
            ClusterPhase::AutoSwitchoverInitiated => write!(f, "AutoSwitchoverInitiated"),
            ClusterPhase::ReplacingPrimary => write!(f, "ReplacingPrimary"),
        }
    }
}

/// Condition describes the state of a cluster at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("Progressing", progressing, reason, message, generation)
    }

    /// Create a "Degraded" condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Degraded", degraded, reason, message, generation)
    }
}

/// Types of conditions for PostgresCluster.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// All members run the target image and the count is on target.
    Ready,
    /// A scale-down or member replacement is in progress.
    Progressing,
    /// Some members could not be probed or the snapshot was inconsistent.
    Degraded,
    /// The replication snapshot is consistent enough to drive a promotion.
    ReplicationConsistent,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Ready => write!(f, "Ready"),
            ConditionType::Progressing => write!(f, "Progressing"),
            ConditionType::Degraded => write!(f, "Degraded"),
            ConditionType::ReplicationConsistent => write!(f, "ReplicationConsistent"),
        }
    }
}

/// Label put on every member Pod to select it back to its cluster.
pub const CLUSTER_LABEL: &str = "pgcluster.io/cluster";

/// Name of the container running the engine inside a member Pod.
pub const POSTGRES_CONTAINER_NAME: &str = "postgres";
