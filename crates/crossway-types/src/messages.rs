//! Domain messages exchanged over the bus.
//!
//! These are the typed forms a lane controller works with. Their JSON shapes
//! live in [`crate::wire`]; nothing in this module knows about topics or
//! payload field names.

use chrono::{DateTime, Utc};

use crate::enums::{LightStatus, SignalAspect};
use crate::ids::LaneId;

/// A vehicle count produced by the detector for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleReport {
    /// The lane the count belongs to.
    pub lane: LaneId,
    /// Number of vehicles waiting.
    pub count: u32,
    /// When the detector produced the count.
    pub timestamp: DateTime<Utc>,
}

/// Peer-to-peer coordination traffic.
///
/// Every variant is a broadcast. Re-delivery is harmless, and no variant
/// carries a session or sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationMessage {
    /// `lane` asks its peers for the right of way.
    GreenRequest {
        /// The requesting lane.
        lane: LaneId,
        /// Wall-clock time of the request.
        requested_at: DateTime<Utc>,
    },
    /// `from_lane` allows `to_lane` to turn green.
    GreenGrant {
        /// The lane being granted.
        to_lane: LaneId,
        /// The lane granting.
        from_lane: LaneId,
    },
    /// `lane` has entered green or returned to red.
    GreenStatus {
        /// The announcing lane.
        lane: LaneId,
        /// The edge being announced.
        status: LightStatus,
        /// Wall-clock time of the change.
        at: DateTime<Utc>,
    },
    /// `from_lane` has handed the turn to `next_expected_lane`.
    NextLaneReady {
        /// The lane whose turn it now is.
        next_expected_lane: LaneId,
        /// The lane that finished (or passed) its turn.
        from_lane: LaneId,
    },
    /// `by_lane` skipped `silent_lane`, which stayed quiet for a whole turn,
    /// and handed the turn to `next_expected_lane`.
    TurnSkipped {
        /// The lane whose turn it now is.
        next_expected_lane: LaneId,
        /// The lane that was skipped.
        silent_lane: LaneId,
        /// The lane that noticed the silence.
        by_lane: LaneId,
    },
    /// Operator reset: every lane returns to its initial state.
    Reset,
}

impl CoordinationMessage {
    /// The lane that originated this message, if any.
    pub const fn origin(&self) -> Option<LaneId> {
        match self {
            Self::GreenRequest { lane, .. } | Self::GreenStatus { lane, .. } => Some(*lane),
            Self::GreenGrant { from_lane, .. } | Self::NextLaneReady { from_lane, .. } => {
                Some(*from_lane)
            }
            Self::TurnSkipped { by_lane, .. } => Some(*by_lane),
            Self::Reset => None,
        }
    }

    /// Short name used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::GreenRequest { .. } => "green_request",
            Self::GreenGrant { .. } => "green_grant",
            Self::GreenStatus { .. } => "green_status",
            Self::NextLaneReady { .. } => "next_lane_ready",
            Self::TurnSkipped { .. } => "turn_skipped",
            Self::Reset => "reset",
        }
    }
}

/// Record of one completed green cycle, for the analytics collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationReport {
    /// The lane that was green.
    pub lane: LaneId,
    /// The vehicle count the duration was computed from.
    pub total_vehicles: u32,
    /// The green duration in seconds.
    pub duration_seconds: f64,
    /// Timestamp of the observation that was served.
    pub timestamp: DateTime<Utc>,
}

/// Diagnostic countdown published while a lane is green or yellow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownSync {
    /// The counting lane.
    pub lane: LaneId,
    /// Whole seconds left in the current phase, rounded up.
    pub remaining_seconds: u64,
    /// The lamp currently shown.
    pub phase: SignalAspect,
    /// Who produced the countdown.
    pub source: String,
}

/// Anything a lane controller accepts from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// A detector count.
    Vehicles(VehicleReport),
    /// Peer or operator coordination traffic.
    Coordination(CoordinationMessage),
}

/// Anything a lane controller publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Peer coordination traffic.
    Coordination(CoordinationMessage),
    /// Completed-cycle record.
    Duration(DurationReport),
    /// Countdown diagnostic.
    Countdown(CountdownSync),
}

impl From<CoordinationMessage> for Outbound {
    fn from(message: CoordinationMessage) -> Self {
        Self::Coordination(message)
    }
}
