//! PostgreSQL client module for member status probing.
//!
//! This module wraps the `tokio-postgres` crate to inspect one live cluster
//! member at a time: a liveness ping over an application-role connection and
//! a replication status read over a privileged connection.
//!
//! ## Architecture
//!
//! - `prober`: Connection handling, timeouts and the `StatusProbe` trait
//! - `types`: Replication status, WAL positions and the ranked cluster snapshot
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgcluster_operator::client::{InstanceProber, ProbeConfig, ProbeTarget, StatusProbe};
//!
//! let prober = InstanceProber::new(ProbeConfig::from_env());
//! let target = ProbeTarget::new("pg-1", Some("10.0.0.12".into()), 5432);
//! let status = prober.read_status(&target, &cancel).await?;
//! if status.is_primary {
//!     println!("{} accepts writes", status.member_name);
//! }
//! ```

pub mod prober;
pub mod types;

pub use prober::{InstanceProber, ProbeConfig, ProbeTarget, StatusProbe};
pub use types::{ClusterStatusSnapshot, Lsn, ProbeError, ReplicationStatus, promotion_order};
