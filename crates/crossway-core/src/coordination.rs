//! One node's belief about the intersection, and the rules for updating it.
//!
//! Nodes never share state. Each keeps its own view of who holds green and
//! whose turn it is, and corrects that view from the traffic it sees. The
//! views converge eventually; the grant rule re-checks eligibility on every
//! request, so a brief disagreement cannot put two lanes on green.
//!
//! Turn bookkeeping:
//!
//! - the lane that finishes a cycle (or passes an empty turn) advances its own
//!   `next_expected` and announces the successor;
//! - idle peers adopt an announcement when it names the successor of its
//!   sender, or when a lane announces red;
//! - lanes that are requesting or running a cycle ignore peer announcements;
//! - a skip sent on a silent lane's behalf never overrides having seen that
//!   lane go green.
//!
//! Green and red statuses are ordered per lane by their timestamps, so a
//! late or replayed status never undoes a newer one.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossway_types::{LaneId, LaneRing};

use crate::clock::Deadline;
use crate::freshness::VehicleObservation;
use crate::lane::Phase;

/// Who a node believes holds green, and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreenHolder {
    /// The lane believed green (possibly this node's own provisional claim).
    pub lane: LaneId,
    /// Monotonic time the belief was formed.
    pub since: Instant,
}

/// An outstanding turn announcement that is repeated until acknowledged by
/// any foreign traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handover {
    /// The lane whose turn it now is.
    pub to: LaneId,
    /// The lane the turn passed from.
    pub from: LaneId,
    /// Repeats still to send.
    pub repeats_left: u32,
    /// When the next repeat is due.
    pub next_repeat: Deadline,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The request came from this node.
    OwnRequest,
    /// Some lane is believed to hold green.
    GreenHeld(LaneId),
    /// It is another lane's turn.
    NotTheirTurn {
        /// The lane this node expects next.
        expected: LaneId,
    },
    /// This node is itself requesting or running a cycle.
    Busy,
}

/// Answer to a peer's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantDecision {
    /// Publish a grant.
    Grant,
    /// Stay silent.
    Deny(DenyReason),
}

/// Result of offering a turn announcement to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    /// `next_expected` moved.
    Adopted,
    /// Already expected that lane.
    Unchanged,
    /// The announcement does not name the sender's successor.
    Invalid,
    /// This node is active and keeps its own turn pointer.
    Busy,
    /// The skipped lane is believed green; the skip is refused.
    HolderActive,
}

/// Per-node protocol state.
///
/// Created at startup with the first lane expected and mutated only by the
/// owning controller.
#[derive(Debug, Clone)]
pub struct CoordinationState {
    pub(crate) phase: Phase,
    pub(crate) current_green: Option<GreenHolder>,
    pub(crate) next_expected: LaneId,
    pub(crate) pending: Option<VehicleObservation>,
    pub(crate) retry_after: Option<Deadline>,
    pub(crate) handover: Option<Handover>,
    pub(crate) turn_since: Instant,
    pub(crate) quiet_since: Instant,
    pub(crate) last_status: BTreeMap<LaneId, DateTime<Utc>>,
}

impl CoordinationState {
    /// Initial state: idle, nobody green, `first` expected.
    pub const fn new(first: LaneId, now: Instant) -> Self {
        Self {
            phase: Phase::Idle,
            current_green: None,
            next_expected: first,
            pending: None,
            retry_after: None,
            handover: None,
            turn_since: now,
            quiet_since: now,
            last_status: BTreeMap::new(),
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Believed green holder.
    pub const fn current_green(&self) -> Option<GreenHolder> {
        self.current_green
    }

    /// Lane expected to take the next turn.
    pub const fn next_expected(&self) -> LaneId {
        self.next_expected
    }

    /// Latest accepted vehicle count not yet served.
    pub const fn pending(&self) -> Option<&VehicleObservation> {
        self.pending.as_ref()
    }

    /// When the outstanding request was sent, if any.
    pub fn request_sent_at(&self) -> Option<Instant> {
        self.phase.claim().map(crate::lane::ProvisionalClaim::sent_at)
    }

    /// Outstanding turn announcement, if any.
    pub const fn handover(&self) -> Option<&Handover> {
        self.handover.as_ref()
    }

    /// The pending observation, if it may start a cycle.
    pub fn eligible(&self, serve_empty: bool) -> Option<&VehicleObservation> {
        self.pending
            .as_ref()
            .filter(|observation| serve_empty || observation.count() > 0)
    }

    /// Whether `own` may send a request now.
    pub fn may_request(&self, own: LaneId, serve_empty: bool, now: Instant) -> bool {
        matches!(self.phase, Phase::Idle)
            && self.current_green.is_none()
            && self.next_expected == own
            && self.eligible(serve_empty).is_some()
            && self.retry_after.is_none_or(|backoff| backoff.is_due(now))
    }

    /// Decide whether `own` grants `requester`.
    pub fn grant_decision(&self, own: LaneId, requester: LaneId) -> GrantDecision {
        if requester == own {
            GrantDecision::Deny(DenyReason::OwnRequest)
        } else if self.phase.is_active() {
            GrantDecision::Deny(DenyReason::Busy)
        } else if let Some(holder) = self.current_green {
            GrantDecision::Deny(DenyReason::GreenHeld(holder.lane))
        } else if requester != self.next_expected {
            GrantDecision::Deny(DenyReason::NotTheirTurn {
                expected: self.next_expected,
            })
        } else {
            GrantDecision::Grant
        }
    }

    /// Move the turn pointer. Returns `true` if it changed.
    pub fn set_next_expected(&mut self, lane: LaneId, now: Instant) -> bool {
        self.note_progress(now);
        if self.next_expected == lane {
            return false;
        }
        self.next_expected = lane;
        self.turn_since = now;
        true
    }

    /// Record that the ring is moving (a status, announcement, or own
    /// transition was seen).
    pub const fn note_progress(&mut self, now: Instant) {
        self.quiet_since = now;
    }

    /// Order a status from `lane` stamped `at` against the newest one seen.
    ///
    /// Returns `false`, and records nothing, if a status at least as new was
    /// already seen from that lane.
    pub fn observe_status(&mut self, lane: LaneId, at: DateTime<Utc>) -> bool {
        if self.last_status.get(&lane).is_some_and(|newest| at <= *newest) {
            return false;
        }
        self.last_status.insert(lane, at);
        true
    }

    /// A peer announced green.
    pub const fn record_peer_green(&mut self, lane: LaneId, now: Instant) {
        self.current_green = Some(GreenHolder { lane, since: now });
        self.note_progress(now);
    }

    /// A peer announced red. Clears the belief if it named that peer, and
    /// treats the announcement as the end of its turn when this node is idle.
    ///
    /// Returns `true` if the turn pointer moved.
    pub fn record_peer_red(&mut self, lane: LaneId, ring: LaneRing, now: Instant) -> bool {
        self.note_progress(now);
        match self.current_green {
            Some(holder) if holder.lane == lane => self.current_green = None,
            Some(_) => return false,
            None => {}
        }
        if self.phase.is_active() {
            return false;
        }
        self.set_next_expected(ring.successor(lane), now)
    }

    /// Offer a `NextLaneReady { next, from }` announcement.
    pub fn offer_announcement(
        &mut self,
        next: LaneId,
        from: LaneId,
        ring: LaneRing,
        now: Instant,
    ) -> Adoption {
        if ring.successor(from) != next {
            return Adoption::Invalid;
        }
        if self.phase.is_active() {
            self.note_progress(now);
            return Adoption::Busy;
        }
        if self.current_green.is_some_and(|holder| holder.lane == from) {
            self.current_green = None;
        }
        if self.set_next_expected(next, now) {
            Adoption::Adopted
        } else {
            Adoption::Unchanged
        }
    }

    /// Offer a skip of `silent`, sent by a peer that heard nothing from it.
    ///
    /// Unlike an announcement from the lane itself, a skip never clears the
    /// green belief: a node that saw `silent` go green refuses the skip and
    /// waits for its red status or its lease.
    pub fn offer_skip(&mut self, next: LaneId, silent: LaneId, ring: LaneRing, now: Instant) -> Adoption {
        if ring.successor(silent) != next {
            return Adoption::Invalid;
        }
        if self.phase.is_active() {
            self.note_progress(now);
            return Adoption::Busy;
        }
        if self.current_green.is_some_and(|holder| holder.lane == silent) {
            return Adoption::HolderActive;
        }
        if self.set_next_expected(next, now) {
            Adoption::Adopted
        } else {
            Adoption::Unchanged
        }
    }

    /// Start repeating an announcement this node just sent.
    pub fn start_handover(&mut self, to: LaneId, from: LaneId, repeats: u32, every: Duration, now: Instant) {
        self.handover = (repeats > 0).then(|| Handover {
            to,
            from,
            repeats_left: repeats,
            next_repeat: Deadline::after(now, every),
        });
    }

    /// Take the repeat that is due, if any, and schedule the next one.
    pub fn due_handover(&mut self, every: Duration, now: Instant) -> Option<(LaneId, LaneId)> {
        let handover = self.handover.as_mut()?;
        if !handover.next_repeat.is_due(now) {
            return None;
        }
        let announced = (handover.to, handover.from);
        handover.repeats_left = handover.repeats_left.saturating_sub(1);
        handover.next_repeat = Deadline::after(now, every);
        if handover.repeats_left == 0 {
            self.handover = None;
        }
        Some(announced)
    }

    /// Stop repeating the outstanding announcement.
    pub const fn cancel_handover(&mut self) {
        self.handover = None;
    }
}
