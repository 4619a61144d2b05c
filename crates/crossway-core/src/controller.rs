//! The per-lane controller.
//!
//! [`LaneController`] owns one lane's [`CoordinationState`] and turns inbound
//! messages and clock ticks into outbound messages. It never blocks and
//! never talks to the bus itself: the driver feeds it with
//! [`LaneController::handle`], calls [`LaneController::tick`] at a fixed
//! interval, and publishes whatever comes back.
//!
//! Each tick performs at most one phase transition.

use chrono::{DateTime, FixedOffset, Utc};
use crossway_types::{
    CoordinationMessage, CountdownSync, DurationReport, Inbound, LaneId, LaneRing, LightStatus,
    Outbound, PhaseKind, SignalAspect, VehicleReport,
};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{self, Clock, Deadline};
use crate::config::{ConfigError, ControllerConfig};
use crate::coordination::{Adoption, CoordinationState, GrantDecision, GreenHolder};
use crate::freshness::{FreshnessFilter, VehicleObservation, Verdict};
use crate::fuzzy;
use crate::lane::{self, ActiveCycle, Guards, Phase, ProvisionalClaim, ReleaseReason, Transition};
use crate::recovery::Recovery;

/// Errors raised while building a controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The lane id is larger than the configured lane count.
    #[error("lane {lane} is not part of a {lanes}-lane intersection")]
    LaneOutsideRing {
        /// The rejected lane.
        lane: LaneId,
        /// Configured lane count.
        lanes: u32,
    },

    /// The configuration failed validation.
    #[error("invalid controller configuration: {source}")]
    Config {
        /// The underlying configuration error.
        #[from]
        source: ConfigError,
    },
}

/// Coordination logic for one lane.
#[derive(Debug)]
pub struct LaneController<C> {
    lane: LaneId,
    ring: LaneRing,
    offset: FixedOffset,
    config: ControllerConfig,
    grants_required: u32,
    recovery: Recovery,
    clock: C,
    freshness: FreshnessFilter,
    state: CoordinationState,
    last_countdown: Option<(SignalAspect, u64)>,
}

impl<C: Clock> LaneController<C> {
    /// Build the controller for `lane`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Config`] if `config` does not validate and
    /// [`ControllerError::LaneOutsideRing`] if `lane` exceeds the lane count.
    pub fn new(lane: LaneId, config: ControllerConfig, clock: C) -> Result<Self, ControllerError> {
        config.validate()?;
        let (Some(ring), Some(offset)) = (config.intersection.ring(), config.intersection.offset())
        else {
            return Err(ConfigError::Invalid {
                reason: "intersection settings do not describe a ring".to_owned(),
            }
            .into());
        };
        if !ring.contains(lane) {
            return Err(ControllerError::LaneOutsideRing {
                lane,
                lanes: ring.len(),
            });
        }
        let now = clock.monotonic();
        info!(
            lane = %lane,
            lanes = ring.len(),
            grants_required = config.policy.effective_grants(ring.len()),
            "lane controller ready"
        );
        Ok(Self {
            lane,
            ring,
            offset,
            grants_required: config.policy.effective_grants(ring.len()),
            recovery: Recovery::from_config(&config),
            freshness: FreshnessFilter::new(config.timing.observation_max_age()),
            state: CoordinationState::new(ring.first(), now),
            last_countdown: None,
            config,
            clock,
        })
    }

    /// This controller's lane.
    pub const fn lane(&self) -> LaneId {
        self.lane
    }

    /// The intersection's lane ring.
    pub const fn ring(&self) -> LaneRing {
        self.ring
    }

    /// Local UTC offset of the intersection.
    pub const fn utc_offset(&self) -> FixedOffset {
        self.offset
    }

    /// The configuration the controller was built with.
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Protocol state, for inspection.
    pub const fn state(&self) -> &CoordinationState {
        &self.state
    }

    /// Current phase discriminant.
    pub const fn phase(&self) -> PhaseKind {
        self.state.phase.kind()
    }

    /// Lamp the signal head should show.
    pub const fn aspect(&self) -> SignalAspect {
        self.state.phase.aspect()
    }

    /// Process one inbound message and return what to publish.
    pub fn handle(&mut self, inbound: Inbound) -> Vec<Outbound> {
        let mut out = Vec::new();
        match inbound {
            Inbound::Vehicles(report) => self.on_vehicle_report(&report),
            Inbound::Coordination(message) => self.on_coordination(message, &mut out),
        }
        out
    }

    /// Re-evaluate timers and take at most one transition.
    pub fn tick(&mut self) -> Vec<Outbound> {
        let now = self.clock.monotonic();
        let wall = self.clock.wall();
        let mut out = Vec::new();

        self.recover(now, wall, &mut out);

        let guards = Guards {
            may_request: self
                .state
                .may_request(self.lane, self.config.policy.serve_empty_lanes, now),
            grants_required: self.grants_required,
            now,
        };
        match lane::next_transition(&self.state.phase, &guards) {
            Some(transition) => self.apply(transition, now, wall, &mut out),
            None => self.pass_empty_turn(now, &mut out),
        }

        self.repeat_handover(now, &mut out);
        self.push_countdown(now, &mut out);
        out
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn on_vehicle_report(&mut self, report: &VehicleReport) {
        if report.lane != self.lane {
            trace!(lane = %self.lane, other = %report.lane, "ignoring another lane's count");
            return;
        }
        match self.freshness.admit(report, self.clock.wall()) {
            Verdict::Fresh => {
                debug!(lane = %self.lane, count = report.count, "vehicle count accepted");
                self.state.pending = Some(VehicleObservation {
                    report: *report,
                    received_at: self.clock.monotonic(),
                });
            }
            Verdict::Stale => {
                debug!(lane = %self.lane, timestamp = %report.timestamp, "dropped stale vehicle count");
            }
            Verdict::Duplicate => {
                debug!(lane = %self.lane, count = report.count, "dropped duplicate vehicle count");
            }
        }
    }

    fn on_coordination(&mut self, message: CoordinationMessage, out: &mut Vec<Outbound>) {
        let now = self.clock.monotonic();
        let Some(origin) = message.origin() else {
            self.reset(now);
            return;
        };
        if origin == self.lane {
            trace!(lane = %self.lane, kind = message.kind(), "ignoring own message");
            return;
        }
        if !self.names_ring_lanes(&message) {
            debug!(lane = %self.lane, kind = message.kind(), origin = %origin, "dropped message naming a lane outside the ring");
            return;
        }
        let outdated = match message {
            CoordinationMessage::GreenStatus { lane, at, .. } => !self.state.observe_status(lane, at),
            _ => false,
        };
        if outdated {
            debug!(lane = %self.lane, origin = %origin, "dropped status older than one already seen");
            return;
        }
        if let Some(handover) = self.state.handover().copied() {
            debug!(lane = %self.lane, to = %handover.to, heard = %origin, "hand-over acknowledged by peer traffic");
            self.state.cancel_handover();
        }
        // A grant to the expected lane shows that lane is alive and asking,
        // even when its own traffic does not reach this node.
        let expected = self.state.next_expected;
        let concerns_expected = origin == expected
            || matches!(message, CoordinationMessage::GreenGrant { to_lane, .. } if to_lane == expected);
        if concerns_expected {
            self.state.note_progress(now);
        }

        match message {
            CoordinationMessage::GreenRequest { lane, .. } => self.on_request(lane, out),
            CoordinationMessage::GreenGrant { to_lane, from_lane } => {
                self.on_grant(to_lane, from_lane);
            }
            CoordinationMessage::GreenStatus { lane, status: LightStatus::Green, .. } => {
                self.on_peer_green(lane, now);
            }
            CoordinationMessage::GreenStatus { lane, status: LightStatus::Red, .. } => {
                if self.state.record_peer_red(lane, self.ring, now) {
                    debug!(lane = %self.lane, finished = %lane, next = %self.state.next_expected, "turn advanced on red");
                }
            }
            CoordinationMessage::NextLaneReady { next_expected_lane, from_lane } => {
                self.on_announcement(next_expected_lane, from_lane, now);
            }
            CoordinationMessage::TurnSkipped { next_expected_lane, silent_lane, by_lane } => {
                self.on_skip(next_expected_lane, silent_lane, by_lane, now);
            }
            CoordinationMessage::Reset => {}
        }
    }

    fn names_ring_lanes(&self, message: &CoordinationMessage) -> bool {
        match *message {
            CoordinationMessage::GreenRequest { lane, .. }
            | CoordinationMessage::GreenStatus { lane, .. } => self.ring.contains(lane),
            CoordinationMessage::GreenGrant { to_lane: a, from_lane: b }
            | CoordinationMessage::NextLaneReady { next_expected_lane: a, from_lane: b } => {
                self.ring.contains(a) && self.ring.contains(b)
            }
            CoordinationMessage::TurnSkipped { next_expected_lane, silent_lane, by_lane } => {
                self.ring.contains(next_expected_lane)
                    && self.ring.contains(silent_lane)
                    && self.ring.contains(by_lane)
            }
            CoordinationMessage::Reset => true,
        }
    }

    fn on_request(&self, requester: LaneId, out: &mut Vec<Outbound>) {
        match self.state.grant_decision(self.lane, requester) {
            GrantDecision::Grant => {
                debug!(lane = %self.lane, requester = %requester, "granting green");
                out.push(
                    CoordinationMessage::GreenGrant {
                        to_lane: requester,
                        from_lane: self.lane,
                    }
                    .into(),
                );
            }
            GrantDecision::Deny(reason) => {
                debug!(lane = %self.lane, requester = %requester, reason = ?reason, "not granting");
            }
        }
    }

    fn on_grant(&mut self, to: LaneId, from: LaneId) {
        if to != self.lane {
            return;
        }
        if let Phase::Requesting(claim) = &mut self.state.phase {
            if claim.record_grant(from) {
                debug!(lane = %self.lane, from = %from, grants = claim.grant_count(), "grant received");
            }
        } else {
            debug!(lane = %self.lane, from = %from, "ignoring grant outside a request");
        }
    }

    fn on_peer_green(&mut self, peer: LaneId, now: Instant) {
        match self.state.phase.kind() {
            PhaseKind::Green | PhaseKind::Yielding => {
                error!(
                    lane = %self.lane,
                    peer = %peer,
                    "mutual exclusion violated: peer announced green during our cycle"
                );
                self.state.note_progress(now);
            }
            PhaseKind::Requesting => {
                self.state.record_peer_green(peer, now);
                self.release(ReleaseReason::Conflict(peer), now);
            }
            PhaseKind::Idle => {
                debug!(lane = %self.lane, holder = %peer, "peer is green");
                self.state.record_peer_green(peer, now);
            }
        }
    }

    fn on_announcement(&mut self, next: LaneId, from: LaneId, now: Instant) {
        match self.state.offer_announcement(next, from, self.ring, now) {
            Adoption::Adopted => {
                debug!(lane = %self.lane, next = %next, from = %from, "turn advanced on announcement");
            }
            Adoption::Invalid => {
                debug!(lane = %self.lane, next = %next, from = %from, "dropped announcement that skips the ring order");
            }
            Adoption::Unchanged | Adoption::Busy | Adoption::HolderActive => {}
        }
    }

    fn on_skip(&mut self, next: LaneId, silent: LaneId, by: LaneId, now: Instant) {
        match self.state.offer_skip(next, silent, self.ring, now) {
            Adoption::Adopted if silent == self.lane => {
                info!(lane = %self.lane, by = %by, next = %next, "our turn was skipped by a peer that did not hear us");
            }
            Adoption::Adopted => {
                debug!(lane = %self.lane, silent = %silent, by = %by, next = %next, "turn advanced past a silent lane");
            }
            Adoption::HolderActive => {
                debug!(lane = %self.lane, silent = %silent, by = %by, "refused skip of a lane seen green");
            }
            Adoption::Invalid => {
                debug!(lane = %self.lane, next = %next, silent = %silent, "dropped skip that breaks the ring order");
            }
            Adoption::Unchanged | Adoption::Busy => {}
        }
    }

    fn reset(&mut self, now: Instant) {
        let was = self.state.phase.kind();
        Recovery::reset(&mut self.state, &mut self.freshness, self.ring, now);
        self.last_countdown = None;
        info!(lane = %self.lane, from = ?was, "reset: idle, first lane expected");
    }

    // -----------------------------------------------------------------------
    // Timers and transitions
    // -----------------------------------------------------------------------

    fn recover(&mut self, now: Instant, wall: DateTime<Utc>, out: &mut Vec<Outbound>) {
        if let Some(holder) = self.recovery.expire_lease(&mut self.state, self.lane, self.ring, now) {
            warn!(lane = %self.lane, holder = %holder, next = %self.state.next_expected, "green lease expired without a red status");
        }
        if let Some(dropped) = self.recovery.drop_stale_pending(&mut self.state, wall) {
            debug!(lane = %self.lane, count = dropped.count(), "pending count went stale");
        }
        if let Some((silent, next)) = self.recovery.watchdog(&mut self.state, self.lane, self.ring, now) {
            warn!(lane = %self.lane, silent = %silent, next = %next, "expected lane is silent; skipping its turn");
            out.push(
                CoordinationMessage::TurnSkipped {
                    next_expected_lane: next,
                    silent_lane: silent,
                    by_lane: self.lane,
                }
                .into(),
            );
        }
    }

    fn apply(&mut self, transition: Transition, now: Instant, wall: DateTime<Utc>, out: &mut Vec<Outbound>) {
        let was = self.state.phase.kind();
        match transition {
            Transition::Request => self.request(now, wall, out),
            Transition::Confirm => self.enter_green(now, wall, out),
            Transition::Release(reason) => self.release(reason, now),
            Transition::Yield => self.enter_yellow(now),
            Transition::Complete => self.complete(now, wall, out),
        }
        info!(lane = %self.lane, from = ?was, to = ?self.state.phase.kind(), "phase change");
    }

    fn request(&mut self, now: Instant, wall: DateTime<Utc>, out: &mut Vec<Outbound>) {
        let expires = Deadline::after(now, self.config.timing.grant_timeout());
        let claim = ProvisionalClaim::new(self.lane, wall, now, expires);
        out.push(
            CoordinationMessage::GreenRequest {
                lane: claim.lane(),
                requested_at: claim.requested_at(),
            }
            .into(),
        );
        self.state.phase = Phase::Requesting(claim);
        self.state.current_green = Some(GreenHolder {
            lane: self.lane,
            since: now,
        });
        self.state.retry_after = None;
    }

    fn enter_green(&mut self, now: Instant, wall: DateTime<Utc>, out: &mut Vec<Outbound>) {
        let grants = self.state.phase.claim().map_or(0, ProvisionalClaim::grant_count);
        let Some(observation) = self
            .state
            .eligible(self.config.policy.serve_empty_lanes)
            .copied()
        else {
            self.release(ReleaseReason::NothingToServe, now);
            return;
        };
        let rush_hour = fuzzy::is_rush_hour(&self.config.rush_hour, fuzzy::local_hour(wall, self.offset));
        let estimate = fuzzy::defuzzify(&self.config.fuzzy, observation.count(), rush_hour);
        self.state.phase = Phase::Green(ActiveCycle {
            estimate,
            served: observation.key(),
            until: Deadline::after(now, estimate.as_duration()),
        });
        self.state.current_green = Some(GreenHolder {
            lane: self.lane,
            since: now,
        });
        self.state.note_progress(now);
        info!(
            lane = %self.lane,
            count = observation.count(),
            rush_hour,
            seconds = estimate.seconds,
            grants,
            "green"
        );
        out.push(
            CoordinationMessage::GreenStatus {
                lane: self.lane,
                status: LightStatus::Green,
                at: wall,
            }
            .into(),
        );
    }

    fn release(&mut self, reason: ReleaseReason, now: Instant) {
        self.state.phase = Phase::Idle;
        if self.state.current_green.is_some_and(|holder| holder.lane == self.lane) {
            self.state.current_green = None;
        }
        self.state.retry_after = Some(Deadline::after(now, self.config.timing.retry_backoff()));
        match reason {
            ReleaseReason::Timeout => {
                warn!(lane = %self.lane, "no grant before timeout; claim released");
            }
            ReleaseReason::Conflict(peer) => {
                info!(lane = %self.lane, peer = %peer, "peer went green first; claim released");
            }
            ReleaseReason::NothingToServe => {
                info!(lane = %self.lane, "no traffic left to serve; claim released");
            }
        }
    }

    fn enter_yellow(&mut self, now: Instant) {
        if let Some(cycle) = self.state.phase.cycle().copied() {
            self.state.phase = Phase::Yielding(ActiveCycle {
                until: Deadline::after(now, self.config.timing.yellow()),
                ..cycle
            });
        }
    }

    fn complete(&mut self, now: Instant, wall: DateTime<Utc>, out: &mut Vec<Outbound>) {
        let Some(cycle) = self.state.phase.cycle().copied() else {
            return;
        };
        self.state.phase = Phase::Idle;
        self.state.current_green = None;
        if self.state.pending.is_some_and(|pending| pending.key() == cycle.served) {
            self.state.pending = None;
        }
        let next = self.ring.successor(self.lane);
        self.state.set_next_expected(next, now);

        out.push(
            CoordinationMessage::GreenStatus {
                lane: self.lane,
                status: LightStatus::Red,
                at: wall,
            }
            .into(),
        );
        self.announce_turn(next, now, out);
        out.push(Outbound::Duration(DurationReport {
            lane: self.lane,
            total_vehicles: cycle.served.count,
            duration_seconds: cycle.estimate.seconds,
            timestamp: cycle.served.timestamp,
        }));
    }

    /// Hand the turn to `next` when this lane holds it with nothing to serve.
    fn pass_empty_turn(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        let holds_empty_turn = self.ring.len() > 1
            && matches!(self.state.phase, Phase::Idle)
            && self.state.next_expected == self.lane
            && self.state.current_green.is_none()
            && self.state.eligible(self.config.policy.serve_empty_lanes).is_none();
        if !holds_empty_turn
            || now.saturating_duration_since(self.state.turn_since) < self.config.timing.turn_pass_after()
        {
            return;
        }
        let next = self.ring.successor(self.lane);
        self.state.set_next_expected(next, now);
        info!(lane = %self.lane, next = %next, "no traffic; passing turn");
        self.announce_turn(next, now, out);
    }

    fn announce_turn(&mut self, next: LaneId, now: Instant, out: &mut Vec<Outbound>) {
        out.push(
            CoordinationMessage::NextLaneReady {
                next_expected_lane: next,
                from_lane: self.lane,
            }
            .into(),
        );
        if next != self.lane {
            self.state.start_handover(
                next,
                self.lane,
                self.config.timing.handover_repeats,
                self.config.timing.handover_repeat_interval(),
                now,
            );
        }
    }

    fn repeat_handover(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        let every = self.config.timing.handover_repeat_interval();
        if let Some((to, from)) = self.state.due_handover(every, now) {
            debug!(lane = %self.lane, to = %to, "repeating hand-over");
            out.push(
                CoordinationMessage::NextLaneReady {
                    next_expected_lane: to,
                    from_lane: from,
                }
                .into(),
            );
        }
    }

    fn push_countdown(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        let current = self
            .state
            .phase
            .cycle()
            .map(|cycle| (self.state.phase.aspect(), clock::ceil_secs(cycle.until.remaining(now))));
        if current == self.last_countdown {
            return;
        }
        self.last_countdown = current;
        if let Some((phase, remaining_seconds)) = current {
            out.push(Outbound::Countdown(CountdownSync {
                lane: self.lane,
                remaining_seconds,
                phase,
                source: format!("lane-{}", self.lane),
            }));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::arithmetic_side_effects)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;
    use crate::clock::ManualClock;

    /// 12:00 local time at UTC+7, outside both rush windows.
    const MIDDAY: &str = "2025-04-22T05:00:00Z";
    /// 08:00 local time at UTC+7, inside the morning rush.
    const MORNING_RUSH: &str = "2025-04-22T01:00:00Z";

    fn lane(raw: u32) -> LaneId {
        LaneId::new(raw).unwrap()
    }

    fn clock_at(at: &str) -> ManualClock {
        ManualClock::new(DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc))
    }

    fn controller(raw: u32, clock: &ManualClock) -> LaneController<ManualClock> {
        LaneController::new(lane(raw), ControllerConfig::default(), clock.clone()).unwrap()
    }

    fn vehicles(raw: u32, count: u32, clock: &ManualClock) -> Inbound {
        Inbound::Vehicles(VehicleReport {
            lane: lane(raw),
            count,
            timestamp: clock.wall(),
        })
    }

    fn coordination(message: CoordinationMessage) -> Inbound {
        Inbound::Coordination(message)
    }

    fn grant(to: u32, from: u32) -> Inbound {
        coordination(CoordinationMessage::GreenGrant {
            to_lane: lane(to),
            from_lane: lane(from),
        })
    }

    fn coordination_out(out: &[Outbound]) -> Vec<CoordinationMessage> {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Coordination(message) => Some(*message),
                Outbound::Duration(_) | Outbound::Countdown(_) => None,
            })
            .collect()
    }

    /// Drive lane 1 from idle to green with one grant from lane 2.
    fn green_lane_one(clock: &ManualClock, count: u32) -> LaneController<ManualClock> {
        let mut one = controller(1, clock);
        assert!(one.handle(vehicles(1, count, clock)).is_empty());
        let out = one.tick();
        assert!(matches!(
            coordination_out(&out).as_slice(),
            [CoordinationMessage::GreenRequest { .. }]
        ));
        assert!(one.handle(grant(1, 2)).is_empty());
        let out = one.tick();
        assert!(coordination_out(&out).contains(&CoordinationMessage::GreenStatus {
            lane: lane(1),
            status: LightStatus::Green,
            at: clock.wall(),
        }));
        assert_eq!(one.aspect(), SignalAspect::Green);
        one
    }

    fn green_seconds(controller: &LaneController<ManualClock>) -> f64 {
        controller.state().phase().cycle().unwrap().estimate.seconds
    }

    #[test]
    fn requests_when_it_is_our_turn() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        assert!(one.tick().is_empty());
        one.handle(vehicles(1, 3, &clock));
        let out = one.tick();
        assert_eq!(
            coordination_out(&out),
            vec![CoordinationMessage::GreenRequest {
                lane: lane(1),
                requested_at: clock.wall()
            }]
        );
        assert_eq!(one.phase(), PhaseKind::Requesting);
        assert_eq!(one.state().current_green().map(|h| h.lane), Some(lane(1)));
        assert!(one.state().request_sent_at().is_some());
        assert_eq!(one.aspect(), SignalAspect::Red);
    }

    #[test]
    fn does_not_request_out_of_turn() {
        let clock = clock_at(MIDDAY);
        let mut two = controller(2, &clock);
        two.handle(vehicles(2, 9, &clock));
        assert!(two.tick().is_empty());
        assert_eq!(two.phase(), PhaseKind::Idle);
    }

    #[test]
    fn full_cycle_for_light_traffic_off_peak() {
        let clock = clock_at(MIDDAY);
        let mut one = green_lane_one(&clock, 2);
        assert_eq!(green_seconds(&one), 10.0);

        clock.advance(Duration::from_millis(9_900));
        one.tick();
        assert_eq!(one.phase(), PhaseKind::Green);
        clock.advance(Duration::from_millis(100));
        one.tick();
        assert_eq!(one.aspect(), SignalAspect::Yellow);

        clock.advance(Duration::from_secs(2));
        let out = one.tick();
        assert_eq!(one.phase(), PhaseKind::Idle);
        assert_eq!(one.state().next_expected(), lane(2));
        assert_eq!(one.state().current_green(), None);
        assert!(one.state().pending().is_none());

        let messages = coordination_out(&out);
        assert_eq!(
            messages,
            vec![
                CoordinationMessage::GreenStatus {
                    lane: lane(1),
                    status: LightStatus::Red,
                    at: clock.wall()
                },
                CoordinationMessage::NextLaneReady {
                    next_expected_lane: lane(2),
                    from_lane: lane(1)
                },
            ]
        );
        let report = out
            .iter()
            .find_map(|o| match o {
                Outbound::Duration(report) => Some(*report),
                _ => None,
            })
            .unwrap();
        assert_eq!(report.lane, lane(1));
        assert_eq!(report.total_vehicles, 2);
        assert_eq!(report.duration_seconds, 10.0);
    }

    #[test]
    fn rush_hour_stretches_green() {
        let rush = green_lane_one(&clock_at(MORNING_RUSH), 8);
        let normal = green_lane_one(&clock_at(MIDDAY), 8);
        assert_eq!(green_seconds(&rush), 48.0);
        assert_eq!(green_seconds(&normal), 32.0);
    }

    #[test]
    fn empty_lane_served_on_request_gets_fallback() {
        let clock = clock_at(MIDDAY);
        let mut config = ControllerConfig::default();
        config.policy.serve_empty_lanes = true;
        let mut one = LaneController::new(lane(1), config, clock.clone()).unwrap();
        one.handle(vehicles(1, 0, &clock));
        one.tick();
        one.handle(grant(1, 3));
        one.tick();
        assert_eq!(one.phase(), PhaseKind::Green);
        assert_eq!(green_seconds(&one), 20.0);
    }

    #[test]
    fn out_of_turn_request_is_denied_by_every_peer() {
        let clock = clock_at(MIDDAY);
        let request = coordination(CoordinationMessage::GreenRequest {
            lane: lane(2),
            requested_at: clock.wall(),
        });
        for peer in [1, 3, 4] {
            let mut node = controller(peer, &clock);
            assert!(node.handle(request).is_empty(), "lane {peer} granted");
        }
    }

    #[test]
    fn idle_peer_grants_expected_lane() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        let out = three.handle(coordination(CoordinationMessage::GreenRequest {
            lane: lane(1),
            requested_at: clock.wall(),
        }));
        assert_eq!(
            coordination_out(&out),
            vec![CoordinationMessage::GreenGrant {
                to_lane: lane(1),
                from_lane: lane(3)
            }]
        );
    }

    #[test]
    fn reset_mid_green_returns_to_red_baseline() {
        let clock = clock_at(MIDDAY);
        let mut one = green_lane_one(&clock, 5);
        clock.advance(Duration::from_secs(3));
        one.tick();
        assert!(one.handle(coordination(CoordinationMessage::Reset)).is_empty());
        assert_eq!(one.phase(), PhaseKind::Idle);
        assert_eq!(one.aspect(), SignalAspect::Red);
        assert_eq!(one.state().next_expected(), lane(1));
        assert_eq!(one.state().current_green(), None);
        assert!(one.state().pending().is_none());
    }

    #[test]
    fn reset_forgets_freshness_history() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        let report = vehicles(1, 4, &clock);
        one.handle(report);
        one.handle(coordination(CoordinationMessage::Reset));
        one.handle(report);
        assert_eq!(one.state().pending().map(VehicleObservation::count), Some(4));
    }

    #[test]
    fn lost_grant_releases_then_retries() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        one.handle(vehicles(1, 4, &clock));
        one.tick();
        assert_eq!(one.phase(), PhaseKind::Requesting);

        clock.advance(Duration::from_millis(4_900));
        one.tick();
        assert_eq!(one.phase(), PhaseKind::Requesting);
        clock.advance(Duration::from_millis(100));
        assert!(one.tick().is_empty());
        assert_eq!(one.phase(), PhaseKind::Idle);
        assert_eq!(one.state().current_green(), None);

        clock.advance(Duration::from_millis(900));
        assert!(one.tick().is_empty());
        clock.advance(Duration::from_millis(100));
        let out = one.tick();
        assert!(matches!(
            coordination_out(&out).as_slice(),
            [CoordinationMessage::GreenRequest { .. }]
        ));
    }

    #[test]
    fn duplicate_count_changes_nothing() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        let report = vehicles(1, 4, &clock);
        one.handle(report);
        let first = *one.state().pending().unwrap();
        one.tick();
        clock.advance(Duration::from_millis(100));
        assert!(one.handle(report).is_empty());
        assert_eq!(*one.state().pending().unwrap(), first);
        assert!(one.tick().is_empty());
    }

    #[test]
    fn stale_count_is_ignored() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        let old = Inbound::Vehicles(VehicleReport {
            lane: lane(1),
            count: 30,
            timestamp: clock.wall() - TimeDelta::seconds(121),
        });
        assert!(one.handle(old).is_empty());
        assert!(one.state().pending().is_none());
        assert!(one.tick().is_empty());
    }

    #[test]
    fn other_lanes_counts_are_ignored() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        one.handle(vehicles(2, 7, &clock));
        assert!(one.state().pending().is_none());
    }

    #[test]
    fn peer_green_aborts_open_claim() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        one.handle(vehicles(1, 4, &clock));
        one.tick();
        one.handle(coordination(CoordinationMessage::GreenStatus {
            lane: lane(3),
            status: LightStatus::Green,
            at: clock.wall(),
        }));
        assert_eq!(one.phase(), PhaseKind::Idle);
        assert_eq!(one.state().current_green().map(|h| h.lane), Some(lane(3)));
        // A late grant for the aborted claim is ignored.
        one.handle(grant(1, 2));
        one.tick();
        assert_eq!(one.phase(), PhaseKind::Idle);
    }

    #[test]
    fn own_messages_are_ignored() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        let out = three.handle(coordination(CoordinationMessage::NextLaneReady {
            next_expected_lane: lane(4),
            from_lane: lane(3),
        }));
        assert!(out.is_empty());
        assert_eq!(three.state().next_expected(), lane(1));
    }

    #[test]
    fn messages_naming_unknown_lanes_are_dropped() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        let out = three.handle(coordination(CoordinationMessage::GreenRequest {
            lane: lane(9),
            requested_at: clock.wall(),
        }));
        assert!(out.is_empty());
    }

    #[test]
    fn idle_peer_follows_announcements_and_reds() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        three.handle(coordination(CoordinationMessage::NextLaneReady {
            next_expected_lane: lane(2),
            from_lane: lane(1),
        }));
        assert_eq!(three.state().next_expected(), lane(2));
        three.handle(coordination(CoordinationMessage::GreenStatus {
            lane: lane(2),
            status: LightStatus::Green,
            at: clock.wall(),
        }));
        assert_eq!(three.state().current_green().map(|h| h.lane), Some(lane(2)));
        clock.advance(Duration::from_secs(12));
        three.handle(coordination(CoordinationMessage::GreenStatus {
            lane: lane(2),
            status: LightStatus::Red,
            at: clock.wall(),
        }));
        assert_eq!(three.state().current_green(), None);
        assert_eq!(three.state().next_expected(), lane(3));
    }

    #[test]
    fn replayed_green_after_red_is_ignored() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        three.handle(coordination(CoordinationMessage::NextLaneReady {
            next_expected_lane: lane(2),
            from_lane: lane(1),
        }));
        let green = coordination(CoordinationMessage::GreenStatus {
            lane: lane(2),
            status: LightStatus::Green,
            at: clock.wall(),
        });
        three.handle(green);
        clock.advance(Duration::from_secs(12));
        three.handle(coordination(CoordinationMessage::GreenStatus {
            lane: lane(2),
            status: LightStatus::Red,
            at: clock.wall(),
        }));
        three.handle(vehicles(3, 4, &clock));

        clock.advance(Duration::from_millis(100));
        assert!(three.handle(green).is_empty());
        assert_eq!(three.state().current_green(), None);
        let out = three.tick();
        assert!(matches!(
            coordination_out(&out).as_slice(),
            [CoordinationMessage::GreenRequest { .. }]
        ));
    }

    #[test]
    fn replayed_red_does_not_end_a_newer_green() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        let red = coordination(CoordinationMessage::GreenStatus {
            lane: lane(1),
            status: LightStatus::Red,
            at: clock.wall(),
        });
        three.handle(red);
        clock.advance(Duration::from_secs(30));
        three.handle(coordination(CoordinationMessage::GreenStatus {
            lane: lane(1),
            status: LightStatus::Green,
            at: clock.wall(),
        }));
        three.handle(red);
        assert_eq!(three.state().current_green().map(|h| h.lane), Some(lane(1)));
    }

    #[test]
    fn empty_turn_is_passed_and_repeated() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        clock.advance(Duration::from_millis(2_900));
        assert!(one.tick().is_empty());
        clock.advance(Duration::from_millis(100));
        let announce = CoordinationMessage::NextLaneReady {
            next_expected_lane: lane(2),
            from_lane: lane(1),
        };
        assert_eq!(coordination_out(&one.tick()), vec![announce]);
        assert_eq!(one.state().next_expected(), lane(2));

        clock.advance(Duration::from_secs(2));
        assert_eq!(coordination_out(&one.tick()), vec![announce]);
        clock.advance(Duration::from_secs(2));
        assert_eq!(coordination_out(&one.tick()), vec![announce]);
        clock.advance(Duration::from_secs(2));
        assert!(one.tick().is_empty());
    }

    #[test]
    fn peer_traffic_stops_handover_repeats() {
        let clock = clock_at(MIDDAY);
        let mut one = controller(1, &clock);
        clock.advance(Duration::from_secs(3));
        one.tick();
        assert!(one.state().handover().is_some());
        one.handle(coordination(CoordinationMessage::GreenRequest {
            lane: lane(2),
            requested_at: clock.wall(),
        }));
        assert!(one.state().handover().is_none());
        clock.advance(Duration::from_secs(2));
        assert!(one.tick().is_empty());
    }

    #[test]
    fn silent_expected_lane_is_skipped() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        three.handle(coordination(CoordinationMessage::NextLaneReady {
            next_expected_lane: lane(2),
            from_lane: lane(1),
        }));
        clock.advance(Duration::from_millis(71_900));
        assert!(three.tick().is_empty());
        clock.advance(Duration::from_millis(100));
        let out = three.tick();
        assert_eq!(
            coordination_out(&out),
            vec![CoordinationMessage::TurnSkipped {
                next_expected_lane: lane(3),
                silent_lane: lane(2),
                by_lane: lane(3)
            }]
        );
        assert_eq!(three.state().next_expected(), lane(3));
    }

    #[test]
    fn grants_to_the_expected_lane_keep_the_watchdog_away() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        three.handle(coordination(CoordinationMessage::NextLaneReady {
            next_expected_lane: lane(2),
            from_lane: lane(1),
        }));
        clock.advance(Duration::from_secs(40));
        assert!(three.tick().is_empty());
        three.handle(grant(2, 4));
        clock.advance(Duration::from_secs(40));
        assert!(three.tick().is_empty());
        assert_eq!(three.state().next_expected(), lane(2));

        // A grant to some other lane says nothing about lane 2.
        three.handle(grant(4, 1));
        clock.advance(Duration::from_secs(32));
        assert_eq!(
            coordination_out(&three.tick()),
            vec![CoordinationMessage::TurnSkipped {
                next_expected_lane: lane(3),
                silent_lane: lane(2),
                by_lane: lane(3)
            }]
        );
    }

    #[test]
    fn skip_of_a_lane_seen_green_is_refused() {
        let clock = clock_at(MIDDAY);
        let mut four = controller(4, &clock);
        four.handle(coordination(CoordinationMessage::NextLaneReady {
            next_expected_lane: lane(2),
            from_lane: lane(1),
        }));
        four.handle(coordination(CoordinationMessage::GreenStatus {
            lane: lane(2),
            status: LightStatus::Green,
            at: clock.wall(),
        }));
        clock.advance(Duration::from_secs(30));
        four.handle(coordination(CoordinationMessage::TurnSkipped {
            next_expected_lane: lane(3),
            silent_lane: lane(2),
            by_lane: lane(1),
        }));
        assert_eq!(four.state().current_green().map(|h| h.lane), Some(lane(2)));
        assert_eq!(four.state().next_expected(), lane(2));

        let out = four.handle(coordination(CoordinationMessage::GreenRequest {
            lane: lane(3),
            requested_at: clock.wall(),
        }));
        assert!(out.is_empty());
    }

    #[test]
    fn skipped_lane_gives_up_its_turn() {
        let clock = clock_at(MIDDAY);
        let mut two = controller(2, &clock);
        two.handle(coordination(CoordinationMessage::NextLaneReady {
            next_expected_lane: lane(2),
            from_lane: lane(1),
        }));
        two.handle(coordination(CoordinationMessage::TurnSkipped {
            next_expected_lane: lane(3),
            silent_lane: lane(2),
            by_lane: lane(4),
        }));
        assert_eq!(two.state().next_expected(), lane(3));
        two.handle(vehicles(2, 5, &clock));
        assert!(two.tick().is_empty());
        assert_eq!(two.phase(), PhaseKind::Idle);
    }

    #[test]
    fn peer_green_without_red_expires() {
        let clock = clock_at(MIDDAY);
        let mut three = controller(3, &clock);
        three.handle(coordination(CoordinationMessage::GreenStatus {
            lane: lane(1),
            status: LightStatus::Green,
            at: clock.wall(),
        }));
        clock.advance(Duration::from_secs(66));
        three.tick();
        assert!(three.state().current_green().is_some());
        clock.advance(Duration::from_secs(1));
        three.tick();
        assert_eq!(three.state().current_green(), None);
        assert_eq!(three.state().next_expected(), lane(2));
    }

    #[test]
    fn countdown_ticks_once_per_second() {
        let clock = clock_at(MIDDAY);
        let mut one = green_lane_one(&clock, 2);
        let mut seen = Vec::new();
        for _ in 0..30 {
            clock.advance(Duration::from_millis(100));
            for out in one.tick() {
                if let Outbound::Countdown(sync) = out {
                    seen.push(sync.remaining_seconds);
                    assert_eq!(sync.source, "lane-1");
                    assert_eq!(sync.phase, SignalAspect::Green);
                }
            }
        }
        assert_eq!(seen, vec![9, 8, 7]);
    }

    #[test]
    fn fresher_count_survives_the_cycle() {
        let clock = clock_at(MIDDAY);
        let mut one = green_lane_one(&clock, 2);
        clock.advance(Duration::from_secs(1));
        one.handle(vehicles(1, 6, &clock));
        clock.advance(Duration::from_secs(11));
        one.tick();
        one.tick();
        clock.advance(Duration::from_secs(2));
        one.tick();
        assert_eq!(one.phase(), PhaseKind::Idle);
        assert_eq!(one.state().pending().map(VehicleObservation::count), Some(6));
    }

    #[test]
    fn lone_lane_needs_no_grants() {
        let clock = clock_at(MIDDAY);
        let mut config = ControllerConfig::default();
        config.intersection.lane_count = 1;
        let mut only = LaneController::new(lane(1), config, clock.clone()).unwrap();
        only.handle(vehicles(1, 3, &clock));
        only.tick();
        only.tick();
        assert_eq!(only.phase(), PhaseKind::Green);
    }

    #[test]
    fn lane_outside_ring_is_rejected() {
        let clock = clock_at(MIDDAY);
        let result = LaneController::new(lane(5), ControllerConfig::default(), clock);
        assert!(matches!(result, Err(ControllerError::LaneOutsideRing { lanes: 4, .. })));
    }
}
