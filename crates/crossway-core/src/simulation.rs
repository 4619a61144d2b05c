//! Deterministic multi-node runs over an in-memory lossy bus.
//!
//! A [`Simulation`] owns one [`LaneController`] per lane, all sharing a
//! [`ManualClock`]. Each [`Simulation::step`]:
//!
//! 1. advances the clock by the configured step,
//! 2. delivers everything published in the previous step (every node gets
//!    every broadcast, including its sender),
//! 3. ticks every node,
//! 4. encodes what the nodes published and queues it for the next step.
//!
//! Messages go through the real wire codec. Each delivery can be dropped,
//! duplicated (the copy arrives one step after the first delivery) or held
//! back for a while according to a seeded RNG, so a run is reproducible from
//! its [`SimulationOptions`]. Tests can also drop or hold back chosen
//! deliveries with an interceptor and a delayer.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use crossway_types::wire::{self, Topic, WireError};
use crossway_types::{CoordinationMessage, DurationReport, LaneId, LaneRing, LightStatus, Outbound, SignalAspect};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, ManualClock};
use crate::config::{ConfigError, ControllerConfig};
use crate::controller::{ControllerError, LaneController};

/// Errors raised by the simulation harness.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// The configuration failed validation.
    #[error("invalid configuration: {source}")]
    Config {
        /// The underlying configuration error.
        #[from]
        source: ConfigError,
    },

    /// A controller could not be built.
    #[error("controller error: {source}")]
    Controller {
        /// The underlying controller error.
        #[from]
        source: ControllerError,
    },

    /// A published message could not be encoded.
    #[error("wire error: {source}")]
    Wire {
        /// The underlying codec error.
        #[from]
        source: WireError,
    },

    /// A fault rate outside `0.0..=1.0`.
    #[error("{name} must be between 0 and 1, got {value}")]
    InvalidRate {
        /// Which rate.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// A zero-length step would never advance the clock.
    #[error("simulation step must be longer than zero")]
    ZeroStep,
}

/// Knobs for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationOptions {
    /// Probability that any single delivery is lost.
    pub drop_rate: f64,
    /// Probability that a delivery is also re-delivered one step later.
    pub duplicate_rate: f64,
    /// Probability that a delivery is held back.
    pub delay_rate: f64,
    /// Longest hold for a delayed delivery.
    pub max_delay: Duration,
    /// RNG seed for the fault model.
    pub seed: u64,
    /// Simulated time per step.
    pub step: Duration,
    /// Wall-clock time at the start of the run.
    pub start: DateTime<Utc>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            delay_rate: 0.0,
            max_delay: Duration::from_secs(2),
            seed: 7,
            step: Duration::from_millis(100),
            // 2025-04-22 12:00 at UTC+7, outside both rush windows.
            start: DateTime::from_timestamp(1_745_298_000, 0).unwrap_or_default(),
        }
    }
}

/// One message on its way to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Receiving lane.
    pub to: LaneId,
    /// Publishing lane; `None` for detector and operator traffic.
    pub from: Option<LaneId>,
    /// Topic the payload was published on.
    pub topic: Topic,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

/// What happened during a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationReport {
    /// Lanes in the order they announced green.
    pub green_order: Vec<LaneId>,
    /// Most lanes showing green or yellow at the same instant.
    pub max_concurrent_green: usize,
    /// Grants published.
    pub grants: u64,
    /// Completed cycles.
    pub durations: Vec<DurationReport>,
    /// Steps taken.
    pub steps: u64,
    /// Deliveries lost to the fault model.
    pub dropped: u64,
    /// Deliveries lost to the interceptor.
    pub intercepted: u64,
    /// Deliveries duplicated by the fault model.
    pub duplicated: u64,
    /// Deliveries held back by the fault model or the delayer.
    pub delayed: u64,
    /// Deliveries a node could not decode.
    pub undecodable: u64,
}

type Interceptor = Box<dyn FnMut(&Delivery) -> bool>;
type Delayer = Box<dyn FnMut(&Delivery) -> Option<Duration>>;

/// A whole intersection on one in-memory bus.
pub struct Simulation {
    clock: ManualClock,
    ring: LaneRing,
    offset: FixedOffset,
    options: SimulationOptions,
    nodes: Vec<LaneController<ManualClock>>,
    rng: StdRng,
    /// Deliveries keyed by the step that delivers them.
    scheduled: Vec<(u64, Delivery)>,
    interceptor: Option<Interceptor>,
    delayer: Option<Delayer>,
    report: SimulationReport,
}

impl Simulation {
    /// Build one controller per lane of `config`.
    pub fn new(config: &ControllerConfig, options: SimulationOptions) -> Result<Self, SimulationError> {
        check_rate("drop_rate", options.drop_rate)?;
        check_rate("duplicate_rate", options.duplicate_rate)?;
        check_rate("delay_rate", options.delay_rate)?;
        if options.step.is_zero() {
            return Err(SimulationError::ZeroStep);
        }
        config.validate()?;
        let (Some(ring), Some(offset)) = (config.intersection.ring(), config.intersection.offset())
        else {
            return Err(ConfigError::Invalid {
                reason: "intersection settings do not describe a ring".to_owned(),
            }
            .into());
        };

        let clock = ManualClock::new(options.start);
        let nodes = ring
            .lanes()
            .map(|lane| LaneController::new(lane, config.clone(), clock.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            lanes = ring.len(),
            drop_rate = options.drop_rate,
            duplicate_rate = options.duplicate_rate,
            delay_rate = options.delay_rate,
            seed = options.seed,
            "simulation ready"
        );

        Ok(Self {
            clock,
            ring,
            offset,
            options,
            nodes,
            rng: StdRng::seed_from_u64(options.seed),
            scheduled: Vec::new(),
            interceptor: None,
            delayer: None,
            report: SimulationReport::default(),
        })
    }

    /// The shared clock.
    pub const fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// The controller for `lane`.
    pub fn node(&self, lane: LaneId) -> Option<&LaneController<ManualClock>> {
        self.nodes.iter().find(|node| node.lane() == lane)
    }

    /// Every controller, in lane order.
    pub fn nodes(&self) -> impl Iterator<Item = &LaneController<ManualClock>> {
        self.nodes.iter()
    }

    /// Lamps currently shown, in lane order.
    pub fn aspects(&self) -> Vec<(LaneId, SignalAspect)> {
        self.nodes.iter().map(|node| (node.lane(), node.aspect())).collect()
    }

    /// Counters so far.
    pub const fn report(&self) -> &SimulationReport {
        &self.report
    }

    /// Drop every delivery for which `intercept` returns `true`.
    pub fn set_interceptor(&mut self, intercept: impl FnMut(&Delivery) -> bool + 'static) {
        self.interceptor = Some(Box::new(intercept));
    }

    /// Remove the interceptor.
    pub fn clear_interceptor(&mut self) {
        self.interceptor = None;
    }

    /// Hold back every delivery for which `delay` returns a duration.
    pub fn set_delayer(&mut self, delay: impl FnMut(&Delivery) -> Option<Duration> + 'static) {
        self.delayer = Some(Box::new(delay));
    }

    /// Remove the delayer.
    pub fn clear_delayer(&mut self) {
        self.delayer = None;
    }

    /// Publish a detector count for `lane`, stamped with the current wall
    /// time. It arrives on the next step.
    pub fn inject_vehicle_count(&mut self, lane: LaneId, count: u32) -> Result<(), SimulationError> {
        let now = self.clock.wall();
        self.inject_vehicle_report(lane, count, now)
    }

    /// Publish a detector count carrying an explicit `timestamp`.
    pub fn inject_vehicle_report(
        &mut self,
        lane: LaneId,
        count: u32,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SimulationError> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "road_section_id": lane,
            "total_vehicles": count,
            "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }))
        .map_err(WireError::from)?;
        self.broadcast(None, Topic::VehicleCount, &payload);
        Ok(())
    }

    /// Publish an operator reset. It arrives on the next step.
    pub fn inject_reset(&mut self) {
        self.broadcast(None, Topic::Reset, b"true");
    }

    /// Advance one step.
    pub fn step(&mut self) -> Result<(), SimulationError> {
        self.clock.advance(self.options.step);
        self.report.steps = self.report.steps.saturating_add(1);

        let step = self.report.steps;
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|(at, _)| *at <= step);
        self.scheduled = later;

        let mut published = Vec::new();
        for (_, delivery) in due {
            self.deliver(&delivery, &mut published);
        }
        for node in &mut self.nodes {
            let lane = node.lane();
            published.extend(node.tick().into_iter().map(|message| (lane, message)));
        }
        for (lane, message) in published {
            self.publish(lane, &message)?;
        }

        let showing = self
            .nodes
            .iter()
            .filter(|node| node.aspect() != SignalAspect::Red)
            .count();
        if showing > 1 {
            warn!(showing, at = ?self.clock.elapsed(), "more than one lane off red");
        }
        self.report.max_concurrent_green = self.report.max_concurrent_green.max(showing);
        Ok(())
    }

    /// Step until `span` of simulated time has passed.
    pub fn run_for(&mut self, span: Duration) -> Result<(), SimulationError> {
        let until = self.clock.elapsed().saturating_add(span);
        while self.clock.elapsed() < until {
            self.step()?;
        }
        Ok(())
    }

    fn deliver(&mut self, delivery: &Delivery, published: &mut Vec<(LaneId, Outbound)>) {
        let Some(node) = self.nodes.iter_mut().find(|node| node.lane() == delivery.to) else {
            return;
        };
        match wire::decode(delivery.topic, &delivery.payload, self.offset) {
            Ok(inbound) => {
                let lane = node.lane();
                published.extend(node.handle(inbound).into_iter().map(|message| (lane, message)));
            }
            Err(e) => {
                self.report.undecodable = self.report.undecodable.saturating_add(1);
                warn!(to = %delivery.to, topic = %delivery.topic, error = %e, "undecodable delivery");
            }
        }
    }

    fn publish(&mut self, from: LaneId, message: &Outbound) -> Result<(), SimulationError> {
        let (topic, payload) = wire::encode(message)?;
        self.record(from, message);
        if topic.is_inbound() {
            self.broadcast(Some(from), topic, &payload);
        }
        Ok(())
    }

    fn record(&mut self, from: LaneId, message: &Outbound) {
        match message {
            Outbound::Coordination(CoordinationMessage::GreenGrant { .. }) => {
                self.report.grants = self.report.grants.saturating_add(1);
            }
            Outbound::Coordination(CoordinationMessage::GreenStatus {
                lane,
                status: LightStatus::Green,
                ..
            }) => {
                debug!(lane = %lane, at = ?self.clock.elapsed(), "lane went green");
                self.report.green_order.push(*lane);
            }
            Outbound::Duration(report) => self.report.durations.push(*report),
            Outbound::Coordination(_) | Outbound::Countdown(_) => {
                trace!(from = %from, "published");
            }
        }
    }

    fn broadcast(&mut self, from: Option<LaneId>, topic: Topic, payload: &[u8]) {
        for to in self.ring.lanes() {
            self.send(Delivery {
                to,
                from,
                topic,
                payload: payload.to_vec(),
            });
        }
    }

    fn send(&mut self, delivery: Delivery) {
        if self.interceptor.as_mut().is_some_and(|intercept| intercept(&delivery)) {
            self.report.intercepted = self.report.intercepted.saturating_add(1);
            return;
        }
        if self.options.drop_rate > 0.0 && self.rng.random_bool(self.options.drop_rate) {
            self.report.dropped = self.report.dropped.saturating_add(1);
            return;
        }
        let next_step = self.report.steps.saturating_add(1);
        if self.options.duplicate_rate > 0.0 && self.rng.random_bool(self.options.duplicate_rate) {
            self.report.duplicated = self.report.duplicated.saturating_add(1);
            self.scheduled.push((next_step.saturating_add(1), delivery.clone()));
        }
        let hold = self.hold_steps(&delivery);
        if hold > 0 {
            self.report.delayed = self.report.delayed.saturating_add(1);
            trace!(to = %delivery.to, topic = %delivery.topic, steps = hold, "delivery held back");
        }
        self.scheduled.push((next_step.saturating_add(hold), delivery));
    }

    /// Extra steps `delivery` waits beyond the next one.
    fn hold_steps(&mut self, delivery: &Delivery) -> u64 {
        if let Some(delay) = self.delayer.as_mut().and_then(|delay| delay(delivery)) {
            return self.steps_in(delay);
        }
        if self.options.delay_rate > 0.0 && self.rng.random_bool(self.options.delay_rate) {
            let longest = self.steps_in(self.options.max_delay).max(1);
            return self.rng.random_range(1..=longest);
        }
        0
    }

    /// Whole steps covering `span`, rounded up.
    fn steps_in(&self, span: Duration) -> u64 {
        let steps = span.as_nanos().div_ceil(self.options.step.as_nanos());
        u64::try_from(steps).unwrap_or(u64::MAX)
    }
}

fn check_rate(name: &'static str, value: f64) -> Result<(), SimulationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SimulationError::InvalidRate { name, value })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn lane(raw: u32) -> LaneId {
        LaneId::new(raw).unwrap()
    }

    #[test]
    fn rejects_bad_rates_and_steps() {
        let config = ControllerConfig::default();
        let bad_drop = SimulationOptions { drop_rate: 1.5, ..SimulationOptions::default() };
        assert!(matches!(
            Simulation::new(&config, bad_drop),
            Err(SimulationError::InvalidRate { name: "drop_rate", .. })
        ));
        let nan = SimulationOptions { duplicate_rate: f64::NAN, ..SimulationOptions::default() };
        assert!(Simulation::new(&config, nan).is_err());
        let frozen = SimulationOptions { step: Duration::ZERO, ..SimulationOptions::default() };
        assert!(matches!(Simulation::new(&config, frozen), Err(SimulationError::ZeroStep)));
    }

    #[test]
    fn builds_one_node_per_lane() {
        let sim = Simulation::new(&ControllerConfig::default(), SimulationOptions::default()).unwrap();
        assert_eq!(sim.nodes().count(), 4);
        assert!(sim.node(lane(4)).is_some());
        assert!(sim.node(lane(5)).is_none());
        assert!(sim.aspects().iter().all(|(_, aspect)| *aspect == SignalAspect::Red));
    }

    #[test]
    fn default_start_is_off_peak() {
        let start = SimulationOptions::default().start;
        let offset = FixedOffset::east_opt(25_200).unwrap();
        assert_eq!(crate::fuzzy::local_hour(start, offset), 12);
    }

    #[test]
    fn count_reaches_its_lane_on_the_next_step() {
        let mut sim = Simulation::new(&ControllerConfig::default(), SimulationOptions::default()).unwrap();
        sim.inject_vehicle_count(lane(1), 3).unwrap();
        assert!(sim.node(lane(1)).unwrap().state().pending().is_none());
        sim.step().unwrap();
        let pending = sim.node(lane(1)).unwrap().state().pending().copied();
        assert_eq!(pending.map(|p| p.report.count), Some(3));
        assert!(sim.node(lane(2)).unwrap().state().pending().is_none());
    }

    #[test]
    fn delayer_holds_deliveries_back() {
        let mut sim = Simulation::new(&ControllerConfig::default(), SimulationOptions::default()).unwrap();
        sim.set_delayer(|delivery| (delivery.to == lane(1)).then_some(Duration::from_millis(250)));
        sim.inject_vehicle_count(lane(1), 3).unwrap();
        for _ in 0..3 {
            sim.step().unwrap();
            assert!(sim.node(lane(1)).unwrap().state().pending().is_none());
        }
        sim.step().unwrap();
        assert!(sim.node(lane(1)).unwrap().state().pending().is_some());
        assert_eq!(sim.report().delayed, 1);
    }

    #[test]
    fn interceptor_swallows_deliveries() {
        let mut sim = Simulation::new(&ControllerConfig::default(), SimulationOptions::default()).unwrap();
        sim.set_interceptor(|delivery| delivery.topic == Topic::VehicleCount);
        sim.inject_vehicle_count(lane(1), 3).unwrap();
        sim.step().unwrap();
        assert!(sim.node(lane(1)).unwrap().state().pending().is_none());
        assert_eq!(sim.report().intercepted, 4);

        sim.clear_interceptor();
        sim.inject_vehicle_count(lane(1), 3).unwrap();
        sim.step().unwrap();
        assert!(sim.node(lane(1)).unwrap().state().pending().is_some());
    }
}
