//! State machine for rolling upgrade phases.
//!
//! The phase recorded on a `PostgresCluster` moves between reconciliations
//! as members are replaced and the primary is handed off. Plans are checked
//! against this table before the new phase is persisted. The observed world
//! always wins: an unexpected transition is reported, never refused.

use crate::crd::ClusterPhase;

// ============================================================================
// Rollout Events
// ============================================================================

/// Events that move a cluster between rollout phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutEvent {
    /// More members run than requested.
    SurplusMember,

    /// A follower runs a stale image.
    FollowerStale,

    /// Only the primary is stale and the update strategy is Supervised.
    PrimaryStale,

    /// A follower was designated as the next primary.
    SwitchoverDesignated,

    /// The designated member became primary.
    HandoffCompleted,

    /// Every member runs the target image.
    AllCurrent,
}

impl std::fmt::Display for RolloutEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutEvent::SurplusMember => write!(f, "SurplusMember"),
            RolloutEvent::FollowerStale => write!(f, "FollowerStale"),
            RolloutEvent::PrimaryStale => write!(f, "PrimaryStale"),
            RolloutEvent::SwitchoverDesignated => write!(f, "SwitchoverDesignated"),
            RolloutEvent::HandoffCompleted => write!(f, "HandoffCompleted"),
            RolloutEvent::AllCurrent => write!(f, "AllCurrent"),
        }
    }
}

// ============================================================================
// Rollout Transition
// ============================================================================

/// A single valid phase transition.
#[derive(Debug, Clone)]
pub struct RolloutTransition {
    /// Source phase.
    pub from: ClusterPhase,

    /// Target phase.
    pub to: ClusterPhase,

    /// Event that triggers this transition.
    pub event: RolloutEvent,

    /// Human-readable description.
    pub description: &'static str,
}

impl RolloutTransition {
    const fn new(
        from: ClusterPhase,
        to: ClusterPhase,
        event: RolloutEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Outcome of checking a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// The transition is in the table (or stays in place).
    Valid {
        from: ClusterPhase,
        to: ClusterPhase,
    },
    /// No transition with this source, event and target exists.
    Unexpected {
        from: ClusterPhase,
        to: ClusterPhase,
        event: RolloutEvent,
    },
}

impl TransitionResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, TransitionResult::Valid { .. })
    }
}

// ============================================================================
// Rollout State Machine
// ============================================================================

/// Phases a cluster rests in between rollouts. Every rollout may start from
/// any of them.
const SETTLED: [ClusterPhase; 3] = [
    ClusterPhase::Pending,
    ClusterPhase::Converged,
    ClusterPhase::ScalingDown,
];

/// Table of valid rollout phase transitions.
#[derive(Debug, Clone)]
pub struct RolloutStateMachine {
    transitions: Vec<RolloutTransition>,
}

impl Default for RolloutStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RolloutStateMachine {
    pub fn new() -> Self {
        use ClusterPhase::*;
        use RolloutEvent::*;

        let mut transitions = Vec::new();

        for from in SETTLED {
            transitions.extend([
                RolloutTransition::new(
                    from,
                    ReplacingFollower,
                    FollowerStale,
                    "Replace a stale follower",
                ),
                RolloutTransition::new(
                    from,
                    AwaitingManualSwitchover,
                    PrimaryStale,
                    "Primary is stale, wait for a manual switchover",
                ),
                RolloutTransition::new(
                    from,
                    AutoSwitchoverInitiated,
                    SwitchoverDesignated,
                    "Primary is stale, designate a new primary",
                ),
                RolloutTransition::new(from, Converged, AllCurrent, "All members current"),
            ]);
        }

        // Scale-down takes precedence over any rollout step
        for from in [
            Pending,
            Converged,
            ScalingDown,
            ReplacingFollower,
            AwaitingManualSwitchover,
            AutoSwitchoverInitiated,
            ReplacingPrimary,
        ] {
            transitions.push(RolloutTransition::new(
                from,
                ScalingDown,
                SurplusMember,
                "Remove a surplus member",
            ));
        }

        transitions.extend([
            // From ReplacingFollower
            RolloutTransition::new(
                ReplacingFollower,
                Converged,
                AllCurrent,
                "Every follower replaced and primary current",
            ),
            RolloutTransition::new(
                ReplacingFollower,
                AwaitingManualSwitchover,
                PrimaryStale,
                "Followers current, primary waits for a manual switchover",
            ),
            RolloutTransition::new(
                ReplacingFollower,
                AutoSwitchoverInitiated,
                SwitchoverDesignated,
                "Followers current, designate a new primary",
            ),
            // From AwaitingManualSwitchover
            RolloutTransition::new(
                AwaitingManualSwitchover,
                ReplacingPrimary,
                HandoffCompleted,
                "Manual switchover done, replace the former primary",
            ),
            RolloutTransition::new(
                AwaitingManualSwitchover,
                Converged,
                AllCurrent,
                "Primary became current without replacement",
            ),
            // From AutoSwitchoverInitiated
            RolloutTransition::new(
                AutoSwitchoverInitiated,
                ReplacingPrimary,
                HandoffCompleted,
                "Handoff done, replace the former primary",
            ),
            RolloutTransition::new(
                AutoSwitchoverInitiated,
                Converged,
                AllCurrent,
                "Primary became current without replacement",
            ),
            // From ReplacingPrimary
            RolloutTransition::new(
                ReplacingPrimary,
                Converged,
                AllCurrent,
                "Former primary replaced",
            ),
            RolloutTransition::new(
                ReplacingPrimary,
                ReplacingFollower,
                FollowerStale,
                "Another follower became stale",
            ),
        ]);

        Self { transitions }
    }

    /// Find the transition for `event` from `from`.
    pub fn transition(
        &self,
        from: ClusterPhase,
        event: RolloutEvent,
    ) -> Option<&RolloutTransition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
    }

    /// Check if a phase transition is valid (staying in place always is).
    pub fn can_transition(&self, from: ClusterPhase, to: ClusterPhase) -> bool {
        if from == to {
            return true;
        }

        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Check the transition a plan wants to make.
    pub fn check(
        &self,
        from: ClusterPhase,
        to: ClusterPhase,
        event: RolloutEvent,
    ) -> TransitionResult {
        let known = from == to
            || self
                .transitions
                .iter()
                .any(|t| t.from == from && t.to == to && t.event == event);

        if known {
            TransitionResult::Valid { from, to }
        } else {
            TransitionResult::Unexpected { from, to, event }
        }
    }

    /// Get the list of valid next phases from a given phase.
    pub fn valid_transitions(&self, from: ClusterPhase) -> Vec<ClusterPhase> {
        self.transitions
            .iter()
            .filter(|t| t.from == from)
            .map(|t| t.to)
            .collect()
    }

    /// Events accepted in a given phase.
    pub fn valid_events(&self, from: ClusterPhase) -> Vec<RolloutEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == from)
            .map(|t| t.event)
            .collect()
    }
}
