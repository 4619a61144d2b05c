//! Lane phases and the transition guard.
//!
//! ```text
//!            request                confirmed
//!   Idle ────────────> Requesting ─────────────> Green
//!    ^                    │ timeout / conflict     │ countdown done
//!    │ <──────────────────┘                        v
//!    └──────────────────────────────────────── Yielding
//!                      yellow done
//! ```
//!
//! [`next_transition`] only decides *which* edge to take; the controller
//! performs it and publishes the resulting messages.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossway_types::{LaneId, PhaseKind, SignalAspect};

use crate::clock::Deadline;
use crate::freshness::ObservationKey;
use crate::fuzzy::DurationEstimate;

/// An unconfirmed local claim on the right of way.
///
/// While a claim is held the node believes itself to be the green holder,
/// so it refuses to grant anyone else. The claim is confirmed by enough
/// grants from distinct peers, or released when `expires` falls due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalClaim {
    lane: LaneId,
    requested_at: DateTime<Utc>,
    sent_at: Instant,
    expires: Deadline,
    grants: BTreeSet<LaneId>,
}

impl ProvisionalClaim {
    /// A claim for `lane` sent at `sent_at`, expiring at `expires`.
    pub const fn new(
        lane: LaneId,
        requested_at: DateTime<Utc>,
        sent_at: Instant,
        expires: Deadline,
    ) -> Self {
        Self {
            lane,
            requested_at,
            sent_at,
            expires,
            grants: BTreeSet::new(),
        }
    }

    /// The claiming lane.
    pub const fn lane(&self) -> LaneId {
        self.lane
    }

    /// Wall-clock time carried in the request.
    pub const fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// Monotonic time the request was sent.
    pub const fn sent_at(&self) -> Instant {
        self.sent_at
    }

    /// When the claim lapses without confirmation.
    pub const fn expires(&self) -> Deadline {
        self.expires
    }

    /// Record a grant from `from`. Returns `false` for a repeat grant.
    pub fn record_grant(&mut self, from: LaneId) -> bool {
        self.grants.insert(from)
    }

    /// Number of distinct peers that granted.
    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    /// Whether at least `required` distinct peers granted.
    pub fn is_confirmed(&self, required: u32) -> bool {
        usize::try_from(required).is_ok_and(|needed| self.grants.len() >= needed)
    }
}

/// A green cycle in progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveCycle {
    /// Duration the lane was given.
    pub estimate: DurationEstimate,
    /// The observation being served.
    pub served: ObservationKey,
    /// When the current phase (green or yellow) ends.
    pub until: Deadline,
}

/// What a lane is doing, with the data each phase needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// Red, not asking.
    Idle,
    /// Red, waiting for grants.
    Requesting(ProvisionalClaim),
    /// Green, counting down.
    Green(ActiveCycle),
    /// Yellow, clearing.
    Yielding(ActiveCycle),
}

impl Phase {
    /// Data-free discriminant.
    pub const fn kind(&self) -> PhaseKind {
        match self {
            Self::Idle => PhaseKind::Idle,
            Self::Requesting(_) => PhaseKind::Requesting,
            Self::Green(_) => PhaseKind::Green,
            Self::Yielding(_) => PhaseKind::Yielding,
        }
    }

    /// Lamp shown in this phase.
    pub const fn aspect(&self) -> SignalAspect {
        self.kind().aspect()
    }

    /// Whether the lane is anywhere but idle.
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// The outstanding claim, if requesting.
    pub const fn claim(&self) -> Option<&ProvisionalClaim> {
        match self {
            Self::Requesting(claim) => Some(claim),
            _ => None,
        }
    }

    /// The running cycle, if green or yellow.
    pub const fn cycle(&self) -> Option<&ActiveCycle> {
        match self {
            Self::Green(cycle) | Self::Yielding(cycle) => Some(cycle),
            Self::Idle | Self::Requesting(_) => None,
        }
    }
}

/// Why a claim was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// No confirmation within the grant timeout.
    Timeout,
    /// Another lane announced green while the claim was open.
    Conflict(LaneId),
    /// Confirmed, but the pending count is no longer eligible.
    NothingToServe,
}

/// An edge of the lane state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Idle to Requesting.
    Request,
    /// Requesting to Green.
    Confirm,
    /// Requesting to Idle.
    Release(ReleaseReason),
    /// Green to Yielding.
    Yield,
    /// Yielding to Idle; the turn passes on.
    Complete,
}

/// Facts the guard needs beyond the phase itself.
#[derive(Debug, Clone, Copy)]
pub struct Guards {
    /// Eligible data, no green holder, our turn, not backing off.
    pub may_request: bool,
    /// Distinct grants needed to confirm a claim.
    pub grants_required: u32,
    /// Current monotonic time.
    pub now: Instant,
}

/// The edge to take from `phase`, if any.
pub fn next_transition(phase: &Phase, guards: &Guards) -> Option<Transition> {
    match phase {
        Phase::Idle => guards.may_request.then_some(Transition::Request),
        Phase::Requesting(claim) => {
            if claim.is_confirmed(guards.grants_required) {
                Some(Transition::Confirm)
            } else if claim.expires().is_due(guards.now) {
                Some(Transition::Release(ReleaseReason::Timeout))
            } else {
                None
            }
        }
        Phase::Green(cycle) => cycle.until.is_due(guards.now).then_some(Transition::Yield),
        Phase::Yielding(cycle) => cycle.until.is_due(guards.now).then_some(Transition::Complete),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fuzzy::EstimateBasis;

    fn lane(raw: u32) -> LaneId {
        LaneId::new(raw).unwrap()
    }

    fn claim(now: Instant) -> ProvisionalClaim {
        ProvisionalClaim::new(lane(1), Utc::now(), now, Deadline::after(now, Duration::from_secs(5)))
    }

    fn cycle(now: Instant, secs: u64) -> ActiveCycle {
        ActiveCycle {
            estimate: DurationEstimate {
                seconds: 10.0,
                basis: EstimateBasis { count: 2, rush_hour: false },
            },
            served: ObservationKey { lane: lane(1), count: 2, timestamp: Utc::now() },
            until: Deadline::after(now, Duration::from_secs(secs)),
        }
    }

    fn guards(now: Instant, may_request: bool) -> Guards {
        Guards { may_request, grants_required: 1, now }
    }

    #[test]
    fn idle_requests_only_when_allowed() {
        let now = Instant::now();
        assert_eq!(next_transition(&Phase::Idle, &guards(now, false)), None);
        assert_eq!(next_transition(&Phase::Idle, &guards(now, true)), Some(Transition::Request));
    }

    #[test]
    fn grant_confirms_claim() {
        let now = Instant::now();
        let mut pending = claim(now);
        assert_eq!(next_transition(&Phase::Requesting(pending.clone()), &guards(now, false)), None);
        assert!(pending.record_grant(lane(2)));
        assert!(!pending.record_grant(lane(2)));
        assert_eq!(pending.grant_count(), 1);
        assert_eq!(
            next_transition(&Phase::Requesting(pending), &guards(now, false)),
            Some(Transition::Confirm)
        );
    }

    #[test]
    fn quorum_counts_distinct_peers() {
        let now = Instant::now();
        let mut pending = claim(now);
        pending.record_grant(lane(2));
        pending.record_grant(lane(2));
        assert!(!pending.is_confirmed(2));
        pending.record_grant(lane(3));
        assert!(pending.is_confirmed(2));
    }

    #[test]
    fn lone_lane_confirms_without_grants() {
        let now = Instant::now();
        let lone = Guards { may_request: false, grants_required: 0, now };
        assert_eq!(next_transition(&Phase::Requesting(claim(now)), &lone), Some(Transition::Confirm));
    }

    #[test]
    fn unconfirmed_claim_times_out() {
        let now = Instant::now();
        let later = now.checked_add(Duration::from_secs(5)).unwrap();
        assert_eq!(
            next_transition(&Phase::Requesting(claim(now)), &guards(later, true)),
            Some(Transition::Release(ReleaseReason::Timeout))
        );
    }

    #[test]
    fn green_yields_then_completes() {
        let now = Instant::now();
        let later = now.checked_add(Duration::from_secs(10)).unwrap();
        assert_eq!(next_transition(&Phase::Green(cycle(now, 10)), &guards(now, true)), None);
        assert_eq!(
            next_transition(&Phase::Green(cycle(now, 10)), &guards(later, true)),
            Some(Transition::Yield)
        );
        assert_eq!(
            next_transition(&Phase::Yielding(cycle(now, 2)), &guards(later, true)),
            Some(Transition::Complete)
        );
    }

    #[test]
    fn phases_show_expected_lamps() {
        let now = Instant::now();
        assert_eq!(Phase::Idle.aspect(), SignalAspect::Red);
        assert_eq!(Phase::Requesting(claim(now)).aspect(), SignalAspect::Red);
        assert_eq!(Phase::Green(cycle(now, 1)).aspect(), SignalAspect::Green);
        assert_eq!(Phase::Yielding(cycle(now, 1)).aspect(), SignalAspect::Yellow);
    }
}
