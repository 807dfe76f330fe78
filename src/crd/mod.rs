//! Custom Resource Definitions (CRDs) for pgcluster-operator.
//!
//! - `PostgresCluster`: Declare a replicated PostgreSQL cluster, its target
//!   image, member count and primary update strategy

mod postgres_cluster;

pub use postgres_cluster::*;
