//! Signal head output.
//!
//! The controller only decides which lamp to show. Driving real lamps is
//! hardware specific, so it sits behind [`SignalActuator`]; the default
//! implementation logs the lamp states.

use crossway_types::{LaneId, SignalAspect};
use tracing::info;

/// Something that can show a lamp state.
pub trait SignalActuator {
    /// Switch `lane`'s signal head to `aspect`.
    fn show(&mut self, lane: LaneId, aspect: SignalAspect);
}

/// Writes every lamp change to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingActuator;

impl SignalActuator for LoggingActuator {
    fn show(&mut self, lane: LaneId, aspect: SignalAspect) {
        let (red, yellow, green) = aspect.lamps();
        info!(
            lane = %lane,
            aspect = aspect.as_str(),
            red,
            yellow,
            green,
            "signal head updated"
        );
    }
}
