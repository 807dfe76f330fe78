//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for reconciliation metrics (namespace + name)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ReconcileLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for phase-based metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for member deletions (namespace + name + reason)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DeletionLabels {
    pub namespace: String,
    pub name: String,
    pub reason: String,
}

impl EncodeLabelSet for DeletionLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("reason", self.reason.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Why a member was deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionReason {
    ScaleDown,
    Upgrade,
}

impl DeletionReason {
    fn as_str(&self) -> &'static str {
        match self {
            DeletionReason::ScaleDown => "scale_down",
            DeletionReason::Upgrade => "upgrade",
        }
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Total clusters by phase
    pub clusters_total: Family<PhaseLabels, Gauge>,
    /// Desired members per cluster
    pub cluster_instances_desired: Family<ReconcileLabels, Gauge>,
    /// Members that answered the last status probe
    pub cluster_instances_ready: Family<ReconcileLabels, Gauge>,
    /// Members deleted, by reason
    pub members_deleted_total: Family<DeletionLabels, Counter>,
    /// Switchovers initiated by designating a new primary
    pub switchovers_initiated_total: Family<ReconcileLabels, Counter>,
    /// Member probes that failed
    pub probe_failures_total: Family<ReconcileLabels, Counter>,
    /// Last recorded phase of each cluster, backing `clusters_total`
    cluster_phases: Mutex<HashMap<ReconcileLabels, String>>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "pgcluster_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "pgcluster_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "pgcluster_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let clusters_total = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "pgcluster_clusters",
            "Number of PostgresCluster resources by phase",
            clusters_total.clone(),
        );

        let cluster_instances_desired = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "pgcluster_instances_desired",
            "Desired number of members for each cluster",
            cluster_instances_desired.clone(),
        );

        let cluster_instances_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "pgcluster_instances_ready",
            "Number of members that answered the last status probe",
            cluster_instances_ready.clone(),
        );

        let members_deleted_total = Family::<DeletionLabels, Counter>::default();
        registry.register(
            "pgcluster_members_deleted",
            "Total number of members deleted by the operator",
            members_deleted_total.clone(),
        );

        let switchovers_initiated_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "pgcluster_switchovers_initiated",
            "Total number of switchovers initiated by designating a new primary",
            switchovers_initiated_total.clone(),
        );

        let probe_failures_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "pgcluster_probe_failures",
            "Total number of failed member status probes",
            probe_failures_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            clusters_total,
            cluster_instances_desired,
            cluster_instances_ready,
            members_deleted_total,
            switchovers_initiated_total,
            probe_failures_total,
            cluster_phases: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    /// Update cluster count by phase
    pub fn set_clusters_by_phase(&self, phase: &str, count: i64) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.clusters_total.get_or_create(&labels).set(count);
    }

    /// Record the phase a cluster ended its cycle in and refresh the
    /// per-phase gauges. `None` forgets the cluster.
    pub fn record_cluster_phase(&self, namespace: &str, name: &str, phase: Option<&str>) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        let mut phases = self
            .cluster_phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut touched = BTreeSet::new();
        let previous = match phase {
            Some(phase) => phases.insert(labels, phase.to_string()),
            None => phases.remove(&labels),
        };
        touched.extend(previous);
        touched.extend(phase.map(str::to_string));

        for phase in touched {
            let count = phases.values().filter(|p| **p == phase).count();
            self.set_clusters_by_phase(&phase, i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    /// Update member count metrics
    pub fn set_cluster_instances(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.cluster_instances_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_instances_ready
            .get_or_create(&labels)
            .set(ready);
    }

    /// Record a member deletion
    pub fn record_member_deleted(&self, namespace: &str, name: &str, reason: DeletionReason) {
        let labels = DeletionLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: reason.as_str().to_string(),
        };
        self.members_deleted_total.get_or_create(&labels).inc();
    }

    /// Record a designated switchover
    pub fn record_switchover(&self, namespace: &str, name: &str) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.switchovers_initiated_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record failed member probes
    pub fn record_probe_failures(&self, namespace: &str, name: &str, failures: u64) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.probe_failures_total
            .get_or_create(&labels)
            .inc_by(failures);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (acquired leadership and running controller)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp (Unix epoch seconds)
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Remember when a reconciliation last succeeded
    pub fn mark_reconciled(&self) {
        let now = u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or(0);
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
/// This is a simple check - if we can respond, we're alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(port = 8080, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
