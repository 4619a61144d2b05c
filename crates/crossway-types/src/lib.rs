//! Shared type definitions for the Crossway signal coordinator.
//!
//! This crate is the single source of truth for everything that crosses the
//! message bus: lane identities and their cyclic order, the coordination
//! messages exchanged between lane controllers, the records published for
//! collaborators, and the JSON codec that maps them onto bus topics.
//!
//! # Modules
//!
//! - [`ids`] -- Lane identifiers and the fixed cyclic lane order
//! - [`enums`] -- Light, aspect, and phase enumerations
//! - [`messages`] -- Domain messages (inbound and outbound)
//! - [`wire`] -- Topic table and strict JSON encode/decode

pub mod enums;
pub mod ids;
pub mod messages;
pub mod wire;

// Re-export all public types at crate root for convenience.
pub use enums::{LightStatus, PhaseKind, SignalAspect};
pub use ids::{LaneId, LaneRing};
pub use messages::{
    CoordinationMessage, CountdownSync, DurationReport, Inbound, Outbound, VehicleReport,
};
pub use wire::{Topic, WireError};
