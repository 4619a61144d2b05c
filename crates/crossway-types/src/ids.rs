//! Lane identity and the fixed cyclic lane order.
//!
//! Lanes are numbered `1..=N`. The number is the lane's position in the
//! round-robin order, and the order wraps from `N` back to `1`. A lane
//! number of zero is never valid; "no lane" is `Option<LaneId>`.

use serde::{Deserialize, Serialize};

/// A lane number that is zero and therefore not a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lane id must be at least 1")]
pub struct InvalidLaneId;

/// Identity of one traffic lane (one controller on the bus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct LaneId(u32);

impl LaneId {
    /// The first lane of every ring.
    pub const FIRST: Self = Self(1);

    /// Build a lane id, rejecting zero.
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    /// Return the lane number.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for LaneId {
    type Error = InvalidLaneId;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or(InvalidLaneId)
    }
}

impl From<LaneId> for u32 {
    fn from(lane: LaneId) -> Self {
        lane.0
    }
}

impl core::fmt::Display for LaneId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed cyclic order `1, 2, ..., N, 1, ...` shared by every lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneRing {
    count: u32,
}

impl LaneRing {
    /// Build a ring of `count` lanes. Returns `None` for an empty ring.
    pub const fn new(count: u32) -> Option<Self> {
        if count == 0 { None } else { Some(Self { count }) }
    }

    /// Number of lanes in the ring.
    pub const fn len(self) -> u32 {
        self.count
    }

    /// Rings are never empty; provided for API symmetry with `len`.
    pub const fn is_empty(self) -> bool {
        false
    }

    /// The lane that starts every cycle.
    pub const fn first(self) -> LaneId {
        LaneId::FIRST
    }

    /// Whether `lane` belongs to this ring.
    pub const fn contains(self, lane: LaneId) -> bool {
        lane.0 <= self.count
    }

    /// The lane that follows `lane` in cyclic order.
    ///
    /// Lanes outside the ring wrap to the first lane.
    pub const fn successor(self, lane: LaneId) -> LaneId {
        if lane.0 >= self.count {
            LaneId::FIRST
        } else {
            LaneId(lane.0.saturating_add(1))
        }
    }

    /// Iterate over every lane in cyclic order, starting at the first.
    pub fn lanes(self) -> impl Iterator<Item = LaneId> {
        (1..=self.count).map(LaneId)
    }
}
