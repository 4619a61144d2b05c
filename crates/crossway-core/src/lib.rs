//! Decision engine and coordination protocol for one lane controller.
//!
//! Every lane runs the same [`LaneController`], parameterized only by its
//! [`LaneId`](crossway_types::LaneId). Controllers share no memory: they
//! agree on who may show green purely through broadcast messages, taking
//! turns in the fixed cyclic order `1, 2, ..., N, 1, ...`.
//!
//! Nothing in this crate performs I/O or blocks. Time comes from a
//! [`Clock`](clock::Clock), so the whole protocol can be driven from tests and
//! from the [`simulation`] with a manual clock.
//!
//! # Modules
//!
//! - [`clock`] -- Monotonic and wall-clock time sources plus [`Deadline`].
//! - [`config`] -- Configuration loading from `crossway-config.yaml`.
//! - [`fuzzy`] -- Trapezoidal membership and centroid defuzzification.
//! - [`freshness`] -- Stale and duplicate detection for vehicle counts.
//! - [`lane`] -- Lane phases and the transition guard.
//! - [`coordination`] -- Per-node protocol belief and grant decisions.
//! - [`recovery`] -- Reset, green lease, and the silent-turn watchdog.
//! - [`controller`] -- The [`LaneController`] tying the above together.
//! - [`simulation`] -- Deterministic multi-node runs over a lossy bus.
//!
//! [`Deadline`]: clock::Deadline
//! [`LaneController`]: controller::LaneController

pub mod clock;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod freshness;
pub mod fuzzy;
pub mod lane;
pub mod recovery;
pub mod simulation;

pub use controller::{ControllerError, LaneController};
