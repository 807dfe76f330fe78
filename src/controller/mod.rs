//! Controller module for pgcluster-operator.
//!
//! Contains the reconciliation loop, the scale-down and rolling upgrade
//! decision logic, the rollout state machine, error handling and status
//! management.

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod intent;
pub mod members;
pub mod status;
pub mod store;

// PostgresCluster controller
pub mod cluster_reconciler;
pub mod cluster_scale;
pub mod cluster_status;
pub mod cluster_upgrade;
pub mod upgrade_state_machine;
