//! Types for PostgreSQL replication status.
//!
//! These types represent what the status prober reads from a member
//! (`pg_control_system()`, `pg_is_in_recovery()`, WAL positions) and the
//! ranked snapshot the upgrade orchestrator makes promotion decisions from.

use std::cmp::Ordering;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::crd::SnapshotSummary;

/// Errors that can occur while probing a member.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Connection to {member} failed: {source}")]
    Connect {
        member: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("Query on {member} failed: {source}")]
    Query {
        member: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("Timeout after {duration:?} probing {member}")]
    Timeout { member: String, duration: Duration },

    #[error("Member {0} has no address yet")]
    MissingAddress(String),

    #[error("Unexpected result from {member}: {message}")]
    UnexpectedResult { member: String, message: String },

    #[error("Probe of {0} cancelled")]
    Cancelled(String),
}

impl ProbeError {
    /// Name of the member the probe was aimed at.
    pub fn member(&self) -> &str {
        match self {
            ProbeError::Connect { member, .. }
            | ProbeError::Query { member, .. }
            | ProbeError::Timeout { member, .. }
            | ProbeError::UnexpectedResult { member, .. } => member,
            ProbeError::MissingAddress(member) | ProbeError::Cancelled(member) => member,
        }
    }
}

/// Errors that can occur when parsing an LSN.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid LSN: {0}")]
pub struct LsnParseError(String);

/// A write-ahead log position.
///
/// Rendered the way PostgreSQL renders `pg_lsn`: two hex halves separated by
/// a slash (`16/B374D848`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl From<tokio_postgres::types::PgLsn> for Lsn {
    fn from(lsn: tokio_postgres::types::PgLsn) -> Self {
        Lsn(u64::from(lsn))
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| LsnParseError(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.to_string()))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Replication status of one member, as read by the prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    /// Name of the member (Pod) this status was read from.
    pub member_name: String,
    /// Database system identifier. Identical across all members of one cluster.
    pub system_id: String,
    /// Whether the member accepts writes.
    pub is_primary: bool,
    /// Last WAL position received and flushed by a follower.
    pub received_lsn: Option<Lsn>,
    /// Last WAL position replayed by a follower.
    pub replay_lsn: Option<Lsn>,
}

impl ReplicationStatus {
    /// Status of a primary.
    pub fn primary(member_name: impl Into<String>, system_id: impl Into<String>) -> Self {
        Self {
            member_name: member_name.into(),
            system_id: system_id.into(),
            is_primary: true,
            received_lsn: None,
            replay_lsn: None,
        }
    }

    /// Status of a follower.
    pub fn follower(
        member_name: impl Into<String>,
        system_id: impl Into<String>,
        received_lsn: Option<Lsn>,
        replay_lsn: Option<Lsn>,
    ) -> Self {
        Self {
            member_name: member_name.into(),
            system_id: system_id.into(),
            is_primary: false,
            received_lsn,
            replay_lsn,
        }
    }
}

/// Promotion ranking.
///
/// Primaries sort first (by name). Followers sort by replayed position
/// descending, then received position descending, then name ascending. A
/// follower that never reported a position sorts after every follower that
/// did.
pub fn promotion_order(a: &ReplicationStatus, b: &ReplicationStatus) -> Ordering {
    b.is_primary
        .cmp(&a.is_primary)
        .then_with(|| b.replay_lsn.cmp(&a.replay_lsn))
        .then_with(|| b.received_lsn.cmp(&a.received_lsn))
        .then_with(|| a.member_name.cmp(&b.member_name))
}

/// Ranked replication status of every member that answered its probe.
///
/// `items[0]` is the primary when it is reachable and `items[1]` is the best
/// promotion candidate. Two primaries put a primary at index 1, which makes
/// the snapshot unusable for a promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStatusSnapshot {
    /// Ranked statuses.
    pub items: Vec<ReplicationStatus>,
    /// Members whose probe failed.
    pub unreachable: Vec<String>,
    /// Members reporting a system identifier different from the primary's.
    /// Without a reachable primary, every member when they disagree.
    pub foreign: Vec<ReplicationStatus>,
}

impl ClusterStatusSnapshot {
    /// Rank the given statuses, setting aside members that belong to another
    /// database system than the primary. With no primary answering and mixed
    /// system identifiers nothing is ranked.
    pub fn new(mut statuses: Vec<ReplicationStatus>, mut unreachable: Vec<String>) -> Self {
        statuses.sort_by(promotion_order);
        unreachable.sort();

        let reference = statuses
            .iter()
            .find(|s| s.is_primary)
            .map(|s| s.system_id.clone());

        let (items, foreign) = match reference {
            Some(system_id) => statuses.into_iter().partition(|s| s.system_id == system_id),
            None => {
                // No primary to anchor on: only rank members that agree
                let shared = statuses.first().is_none_or(|first| {
                    statuses.iter().all(|s| s.system_id == first.system_id)
                });
                if shared {
                    (statuses, Vec::new())
                } else {
                    (Vec::new(), statuses)
                }
            }
        };

        Self {
            items,
            unreachable,
            foreign,
        }
    }

    /// Status at index 0, if it reports itself as primary.
    pub fn primary(&self) -> Option<&ReplicationStatus> {
        self.items.first().filter(|s| s.is_primary)
    }

    /// Best promotion candidate: the status at index 1.
    pub fn promotion_candidate(&self) -> Option<&ReplicationStatus> {
        self.items.get(1)
    }

    /// Whether the snapshot can safely drive a promotion: at least two
    /// entries and the candidate is not itself a primary.
    pub fn is_consistent_for_promotion(&self) -> bool {
        self.promotion_candidate().is_some_and(|c| !c.is_primary)
    }

    /// Number of members reporting themselves as primary.
    pub fn primary_count(&self) -> usize {
        self.items.iter().filter(|s| s.is_primary).count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Compact summary for the resource status.
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            primary: self.primary().map(|s| s.member_name.clone()),
            promotion_candidate: self.promotion_candidate().map(|s| s.member_name.clone()),
            unreachable: self.unreachable.clone(),
            foreign: self.foreign.iter().map(|s| s.member_name.clone()).collect(),
        }
    }
}
