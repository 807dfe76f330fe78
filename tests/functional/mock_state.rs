//! Mock infrastructure for simulating a cluster in functional tests.
//!
//! `MockClusterStore` stands in for the Kubernetes API and records every
//! call it receives. `MockProber` answers status probes from a fixed table.
//! Both plug into the production controllers through their traits, so the
//! tests exercise the real planning and execution code.
//!
//! `MockCluster` adds the external collaborators on top: members deleted
//! during an upgrade come back on the target image, and a designated
//! switchover completes before the next cycle.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pgcluster_operator::client::{
    ClusterStatusSnapshot, ProbeError, ProbeTarget, ReplicationStatus, StatusProbe,
};
use pgcluster_operator::controller::cluster_status::{observe_primary, take_snapshot};
use pgcluster_operator::controller::cluster_upgrade::{UpgradePlan, upgrade};
use pgcluster_operator::controller::error::{Error, ObjectKind, Result};
use pgcluster_operator::controller::members::{ClusterView, Member, member_name_order};
use pgcluster_operator::controller::store::{ClusterStore, PrimaryStatusUpdate};
use pgcluster_operator::crd::ClusterPhase;
use tokio_util::sync::CancellationToken;

use crate::fixtures::SYSTEM_ID;

/// A call received by the mock store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    ListMembers,
    DeleteMember(String),
    DeleteStorageClaim(String),
    UpdatePrimaryStatus(PrimaryStatusUpdate),
}

#[derive(Debug, Default)]
struct StoreState {
    members: Vec<Member>,
    calls: Vec<StoreCall>,
    failing_member_deletes: HashSet<String>,
    failing_claim_deletes: HashSet<String>,
    conflict_on_update: bool,
    current_primary: Option<String>,
    target_primary: Option<String>,
}

/// Recording `ClusterStore` with injectable failures.
#[derive(Debug, Clone, Default)]
pub struct MockClusterStore {
    state: Arc<Mutex<StoreState>>,
}

pub fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "injected failure".to_string(),
        reason: "InternalError".to_string(),
        code,
    })
}

impl MockClusterStore {
    pub fn new(members: Vec<Member>) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().members = members;
        store
    }

    /// Make the delete of member `name` fail.
    pub fn fail_member_delete(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_member_deletes
            .insert(name.to_string());
        self
    }

    /// Make the delete of the storage claim `name` fail.
    pub fn fail_claim_delete(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_claim_deletes
            .insert(name.to_string());
        self
    }

    /// Make every primary status update fail with a conflict.
    pub fn conflict_on_update(self) -> Self {
        self.state.lock().unwrap().conflict_on_update = true;
        self
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Names of members whose delete was requested.
    pub fn member_deletes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::DeleteMember(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Names of storage claims whose delete was requested.
    pub fn claim_deletes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::DeleteStorageClaim(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Primary status updates received.
    pub fn status_updates(&self) -> Vec<PrimaryStatusUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::UpdatePrimaryStatus(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn members(&self) -> Vec<Member> {
        self.state.lock().unwrap().members.clone()
    }

    pub fn set_members(&self, members: Vec<Member>) {
        self.state.lock().unwrap().members = members;
    }

    pub fn current_primary(&self) -> Option<String> {
        self.state.lock().unwrap().current_primary.clone()
    }

    pub fn target_primary(&self) -> Option<String> {
        self.state.lock().unwrap().target_primary.clone()
    }

    pub fn set_primary(&self, current: Option<&str>, target: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.current_primary = current.map(str::to_string);
        state.target_primary = target.map(str::to_string);
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

impl ClusterStore for MockClusterStore {
    async fn list_members(&self, _cluster: &ClusterView) -> Result<Vec<Member>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::ListMembers);
        let mut members = state.members.clone();
        members.sort_by(|a, b| member_name_order(&a.name, &b.name));
        Ok(members)
    }

    async fn delete_member(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::DeleteMember(name.to_string()));
        if state.failing_member_deletes.contains(name) {
            return Err(Error::Delete {
                kind: ObjectKind::Member,
                name: name.to_string(),
                source: api_error(500),
            });
        }
        state.members.retain(|m| m.name != name);
        Ok(())
    }

    async fn delete_storage_claim(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(StoreCall::DeleteStorageClaim(name.to_string()));
        if state.failing_claim_deletes.contains(name) {
            return Err(Error::Delete {
                kind: ObjectKind::StorageClaim,
                name: name.to_string(),
                source: api_error(500),
            });
        }
        Ok(())
    }

    async fn update_primary_status(
        &self,
        cluster: &ClusterView,
        update: &PrimaryStatusUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(StoreCall::UpdatePrimaryStatus(update.clone()));
        if state.conflict_on_update {
            return Err(Error::Conflict(format!(
                "cluster {} changed since {:?}",
                cluster.name, cluster.resource_version
            )));
        }
        if let Some(current) = &update.current_primary {
            state.current_primary = Some(current.clone());
        }
        if let Some(target) = &update.target_primary {
            state.target_primary = Some(target.clone());
        }
        Ok(())
    }
}

/// `StatusProbe` answering from a table keyed by member name. Members
/// missing from the table time out.
#[derive(Debug, Clone, Default)]
pub struct MockProber {
    statuses: Arc<Mutex<BTreeMap<String, ReplicationStatus>>>,
}

impl MockProber {
    pub fn new(statuses: Vec<ReplicationStatus>) -> Self {
        let prober = Self::default();
        prober.set(statuses);
        prober
    }

    pub fn set(&self, statuses: Vec<ReplicationStatus>) {
        let mut table = self.statuses.lock().unwrap();
        table.clear();
        table.extend(statuses.into_iter().map(|s| (s.member_name.clone(), s)));
    }

    fn lookup(&self, target: &ProbeTarget) -> std::result::Result<ReplicationStatus, ProbeError> {
        self.statuses
            .lock()
            .unwrap()
            .get(&target.member_name)
            .cloned()
            .ok_or_else(|| ProbeError::Timeout {
                member: target.member_name.clone(),
                duration: Duration::from_secs(10),
            })
    }
}

impl StatusProbe for MockProber {
    async fn check_reachable(
        &self,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled(target.member_name.clone()));
        }
        self.lookup(target).map(|_| ())
    }

    async fn read_status(
        &self,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> std::result::Result<ReplicationStatus, ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled(target.member_name.clone()));
        }
        self.lookup(target)
    }
}

/// A cluster whose external collaborators behave well: deleted members are
/// recreated on the target image and designated switchovers complete.
pub struct MockCluster {
    pub view: ClusterView,
    pub store: MockClusterStore,
    pub prober: MockProber,
    /// Phases recorded after each cycle.
    pub phases: Vec<ClusterPhase>,
}

impl MockCluster {
    pub fn new(view: ClusterView, members: Vec<Member>) -> Self {
        let store = MockClusterStore::new(members);
        store.set_primary(view.current_primary.as_deref(), view.target_primary.as_deref());
        let cluster = Self {
            view,
            store,
            prober: MockProber::default(),
            phases: Vec::new(),
        };
        cluster.refresh_probes();
        cluster
    }

    /// Members report their role from the store's `currentPrimary`.
    fn refresh_probes(&self) {
        let primary = self.store.current_primary();
        let statuses = self
            .store
            .members()
            .iter()
            .map(|m| {
                if primary.as_deref() == Some(m.name.as_str()) {
                    ReplicationStatus::primary(m.name.clone(), SYSTEM_ID)
                } else {
                    ReplicationStatus::follower(m.name.clone(), SYSTEM_ID, None, None)
                }
            })
            .collect();
        self.prober.set(statuses);
    }

    /// Run one upgrade cycle the way the reconciler does, then let the
    /// outside world react.
    pub async fn cycle(&mut self) -> Result<UpgradePlan> {
        let cancel = CancellationToken::new();
        self.view.current_primary = self.store.current_primary();
        self.view.target_primary = self.store.target_primary();

        let members = self.store.list_members(&self.view).await?;
        let snapshot: ClusterStatusSnapshot =
            take_snapshot(&self.prober, &self.view, &members, &cancel).await?;
        if let Some(update) = observe_primary(&self.view, &snapshot) {
            self.store.update_primary_status(&self.view, &update).await?;
            self.view.current_primary = self.store.current_primary();
            self.view.target_primary = self.store.target_primary();
        }

        let plan = upgrade(&self.store, &self.view, &members, &snapshot, &cancel).await?;
        self.view.phase = plan.state;
        self.phases.push(plan.state);

        self.provision();
        self.complete_handoff();
        self.refresh_probes();
        Ok(plan)
    }

    /// Recreate deleted members on the target image.
    fn provision(&self) {
        let mut members = self.store.members();
        for name in self.store.member_deletes() {
            if !members.iter().any(|m| m.name == name) {
                members.push(
                    Member::new(name.clone(), "default")
                        .with_image(self.view.image_name.clone())
                        .with_address("10.0.0.1"),
                );
            }
        }
        self.store.set_members(members);
        self.store.clear_calls();
    }

    /// The instance manager promotes the designated member.
    fn complete_handoff(&self) {
        let target = self.store.target_primary();
        if target.is_some() && target != self.store.current_primary() {
            self.store.set_primary(target.as_deref(), target.as_deref());
        }
    }

    /// An operator promotes `name` by hand.
    pub fn manual_switchover(&self, name: &str) {
        self.store.set_primary(Some(name), Some(name));
        self.refresh_probes();
    }

    /// Run cycles until the cluster converges, returning the phases seen.
    pub async fn run_until_converged(&mut self, max_cycles: usize) -> Vec<ClusterPhase> {
        for _ in 0..max_cycles {
            let plan = self.cycle().await.expect("cycle should succeed");
            if plan.state == ClusterPhase::Converged {
                break;
            }
        }
        self.phases.clone()
    }

    /// Images currently running, by member name.
    pub fn images(&self) -> BTreeMap<String, Option<String>> {
        self.store
            .members()
            .into_iter()
            .map(|m| (m.name, m.image))
            .collect()
    }
}
