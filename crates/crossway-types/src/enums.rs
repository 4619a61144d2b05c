//! Enumeration types shared by the lane controllers.

use serde::{Deserialize, Serialize};

/// The light status a lane announces on the `green-status` topic.
///
/// Only the two edges other lanes care about are announced: entering green
/// and returning to red.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightStatus {
    /// The lane has just turned green.
    Green,
    /// The lane has finished its cycle and is red again.
    Red,
}

/// The lamp shown by a lane's signal head.
///
/// Serialized in lowercase; the same strings name the countdown phase on
/// the `countdown-sync` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAspect {
    /// Stop. The baseline every lane returns to.
    Red,
    /// Clearing interval between green and red.
    Yellow,
    /// Right of way.
    Green,
}

impl SignalAspect {
    /// Lamp states as `(red, yellow, green)` for a three-lamp head.
    pub const fn lamps(self) -> (bool, bool, bool) {
        match self {
            Self::Red => (true, false, false),
            Self::Yellow => (false, true, false),
            Self::Green => (false, false, true),
        }
    }

    /// Lowercase name used on the wire and in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Green => "green",
        }
    }
}

/// Data-free discriminant of a lane controller's phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    /// Red, not asking for the right of way.
    Idle,
    /// Red, holding a provisional claim and waiting for a grant.
    Requesting,
    /// Green, counting down the fuzzy duration.
    Green,
    /// Yellow, clearing the intersection before red.
    Yielding,
}

impl PhaseKind {
    /// The lamp shown while in this phase.
    pub const fn aspect(self) -> SignalAspect {
        match self {
            Self::Idle | Self::Requesting => SignalAspect::Red,
            Self::Green => SignalAspect::Green,
            Self::Yielding => SignalAspect::Yellow,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn light_status_is_lowercase_on_the_wire() {
        assert_eq!(serde_json::to_string(&LightStatus::Green).unwrap(), "\"green\"");
        let red: LightStatus = serde_json::from_str("\"red\"").unwrap();
        assert_eq!(red, LightStatus::Red);
        assert!(serde_json::from_str::<LightStatus>("\"amber\"").is_err());
    }

    #[test]
    fn only_green_phase_shows_green() {
        assert_eq!(PhaseKind::Idle.aspect(), SignalAspect::Red);
        assert_eq!(PhaseKind::Requesting.aspect(), SignalAspect::Red);
        assert_eq!(PhaseKind::Green.aspect(), SignalAspect::Green);
        assert_eq!(PhaseKind::Yielding.aspect(), SignalAspect::Yellow);
    }

    #[test]
    fn exactly_one_lamp_is_lit() {
        for aspect in [SignalAspect::Red, SignalAspect::Yellow, SignalAspect::Green] {
            let (r, y, g) = aspect.lamps();
            assert_eq!([r, y, g].iter().filter(|lit| **lit).count(), 1);
        }
    }
}
