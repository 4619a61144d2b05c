//! Getting back to a known state.
//!
//! - An operator reset reinitializes everything, unconditionally.
//! - A peer that announced green but never announced red is forgotten after
//!   the longest cycle it could possibly run (the green lease).
//! - An idle node drops a pending count once it has gone stale.
//! - When the expected lane stays silent and nothing else moves for a full
//!   turn timeout, the turn is skipped past it (the watchdog).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossway_types::{LaneId, LaneRing};

use crate::config::ControllerConfig;
use crate::coordination::CoordinationState;
use crate::freshness::{FreshnessFilter, VehicleObservation};
use crate::fuzzy;
use crate::lane::Phase;

/// Recovery timers derived from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    lease: Option<Duration>,
    turn_timeout: Duration,
    max_age: Duration,
}

impl Recovery {
    /// Derive the lease and watchdog timeouts.
    ///
    /// The lease is the longest possible green plus yellow plus the margin.
    /// The watchdog waits one lease plus one grant timeout.
    pub fn from_config(config: &ControllerConfig) -> Self {
        let lease = fuzzy::max_green(&config.fuzzy)
            .saturating_add(config.timing.yellow())
            .saturating_add(config.timing.green_lease_margin());
        Self {
            lease: config.timing.green_lease_enabled.then_some(lease),
            turn_timeout: lease.saturating_add(config.timing.grant_timeout()),
            max_age: config.timing.observation_max_age(),
        }
    }

    /// How long a peer's green is believed, if leases are enabled.
    pub const fn lease(&self) -> Option<Duration> {
        self.lease
    }

    /// How long a silent turn is tolerated.
    pub const fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }

    /// Reinitialize `state` and forget every accepted observation.
    pub fn reset(state: &mut CoordinationState, freshness: &mut FreshnessFilter, ring: LaneRing, now: Instant) {
        *state = CoordinationState::new(ring.first(), now);
        freshness.clear();
    }

    /// Forget a peer's green once its lease has run out.
    ///
    /// If the turn still points at that peer it moves on to the successor.
    /// Returns the lane whose green was forgotten.
    pub fn expire_lease(
        &self,
        state: &mut CoordinationState,
        own: LaneId,
        ring: LaneRing,
        now: Instant,
    ) -> Option<LaneId> {
        let lease = self.lease?;
        let holder = state.current_green?;
        if holder.lane == own || now.saturating_duration_since(holder.since) < lease {
            return None;
        }
        state.current_green = None;
        if !state.phase.is_active() && state.next_expected == holder.lane {
            state.set_next_expected(ring.successor(holder.lane), now);
        }
        Some(holder.lane)
    }

    /// Drop the pending observation if it went stale while the node was
    /// idle. Returns the dropped observation.
    pub fn drop_stale_pending(
        &self,
        state: &mut CoordinationState,
        wall: DateTime<Utc>,
    ) -> Option<VehicleObservation> {
        if !matches!(state.phase, Phase::Idle) {
            return None;
        }
        if state.pending.is_some_and(|pending| pending.is_stale(wall, self.max_age)) {
            state.pending.take()
        } else {
            None
        }
    }

    /// Skip an expected peer that has been silent for the turn timeout
    /// while nothing else moved.
    ///
    /// Returns `(silent, next)` when the turn was skipped; the caller
    /// publishes the skip so peers (and the silent lane, if it is alive)
    /// can follow.
    pub fn watchdog(
        &self,
        state: &mut CoordinationState,
        own: LaneId,
        ring: LaneRing,
        now: Instant,
    ) -> Option<(LaneId, LaneId)> {
        let silent = state.next_expected;
        let stalled = matches!(state.phase, Phase::Idle)
            && state.current_green.is_none()
            && silent != own
            && now.saturating_duration_since(state.quiet_since) >= self.turn_timeout;
        if !stalled {
            return None;
        }
        let next = ring.successor(silent);
        state.set_next_expected(next, now);
        Some((silent, next))
    }
}
