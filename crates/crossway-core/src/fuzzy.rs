//! Fuzzy green-light duration from a vehicle count.
//!
//! Three trapezoidal membership functions ("low", "medium", "high") grade a
//! vehicle count. The crisp duration is the weighted centroid of the base
//! durations for the current rush-hour flag:
//!
//! ```text
//! duration = (low * short + medium * medium_base + high * long) / (low + medium + high)
//! ```
//!
//! With the default breakpoints a count of zero belongs to no category, so
//! an empty lane falls back to the configured fallback duration.
//!
//! Everything here is pure: the same inputs always give the same estimate.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::Deserialize;

use crate::config::{FuzzyConfig, RushHourConfig};

/// A trapezoidal membership function over vehicle count.
///
/// The degree rises linearly from 0 at `start` to 1 at `peak_start`, stays at
/// 1 until `peak_end`, then falls linearly to 0 at `end`. When `peak_end` and
/// `end` are both absent the right shoulder is open: the degree stays at 1
/// for every larger count.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Trapezoid {
    /// Last count with degree 0 on the rising edge.
    pub start: f64,
    /// First count with degree 1.
    pub peak_start: f64,
    /// Last count with degree 1, or `None` for an open shoulder.
    #[serde(default)]
    pub peak_end: Option<f64>,
    /// First count with degree 0 on the falling edge, or `None` for an open
    /// shoulder.
    #[serde(default)]
    pub end: Option<f64>,
}

impl Trapezoid {
    /// A trapezoid that falls back to zero.
    pub const fn closed(start: f64, peak_start: f64, peak_end: f64, end: f64) -> Self {
        Self {
            start,
            peak_start,
            peak_end: Some(peak_end),
            end: Some(end),
        }
    }

    /// A trapezoid whose right shoulder never falls.
    pub const fn open(start: f64, peak_start: f64) -> Self {
        Self {
            start,
            peak_start,
            peak_end: None,
            end: None,
        }
    }

    /// Whether the right shoulder is open.
    pub const fn is_open(&self) -> bool {
        self.peak_end.is_none() && self.end.is_none()
    }

    /// Membership degree of `x`, in `[0, 1]`.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn degree(&self, x: f64) -> f64 {
        if x <= self.start {
            return 0.0;
        }
        if x < self.peak_start {
            return (x - self.start) / (self.peak_start - self.start);
        }
        match (self.peak_end, self.end) {
            (Some(peak_end), Some(end)) => {
                if x <= peak_end {
                    1.0
                } else if x < end {
                    (end - x) / (end - peak_end)
                } else {
                    0.0
                }
            }
            _ => 1.0,
        }
    }

    /// Check that the breakpoints are finite and ordered.
    pub(crate) fn check(&self, name: &str) -> Result<(), String> {
        let points = [Some(self.start), Some(self.peak_start), self.peak_end, self.end];
        if points.iter().flatten().any(|p| !p.is_finite()) {
            return Err(format!("{name}: breakpoints must be finite"));
        }
        match (self.peak_end, self.end) {
            (Some(peak_end), Some(end)) => {
                if !(self.start <= self.peak_start && self.peak_start <= peak_end && peak_end <= end)
                {
                    return Err(format!("{name}: breakpoints must be non-decreasing"));
                }
            }
            (None, None) => {
                if self.start > self.peak_start {
                    return Err(format!("{name}: start must not exceed peak_start"));
                }
            }
            _ => {
                return Err(format!("{name}: peak_end and end must both be set or both omitted"));
            }
        }
        Ok(())
    }
}

/// Base green durations, in seconds, for one time-of-day regime.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DurationTable {
    /// Duration for a fully "low" count.
    pub short: f64,
    /// Duration for a fully "medium" count.
    pub medium: f64,
    /// Duration for a fully "high" count.
    pub long: f64,
    /// Duration used when no category has any membership.
    pub fallback: f64,
}

impl DurationTable {
    /// Base durations outside rush hour.
    pub const NORMAL: Self = Self {
        short: 10.0,
        medium: 20.0,
        long: 40.0,
        fallback: 20.0,
    };

    /// Base durations during rush hour.
    pub const RUSH: Self = Self {
        short: 15.0,
        medium: 30.0,
        long: 60.0,
        fallback: 30.0,
    };

    /// The largest duration this table can produce.
    pub const fn max(&self) -> f64 {
        self.short.max(self.medium).max(self.long).max(self.fallback)
    }

    pub(crate) fn check(&self, name: &str) -> Result<(), String> {
        let values = [self.short, self.medium, self.long, self.fallback];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(format!("{name}: durations must be finite and non-negative"));
        }
        Ok(())
    }
}

/// An inclusive range of hours of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HourWindow {
    /// First hour in the window (0-23).
    pub start: u32,
    /// Last hour in the window (0-23).
    pub end: u32,
}

impl HourWindow {
    /// Whether `hour` falls inside the window.
    pub const fn contains(self, hour: u32) -> bool {
        self.start <= hour && hour <= self.end
    }
}

/// Degrees of membership for one count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MembershipDegrees {
    /// Degree of "low".
    pub low: f64,
    /// Degree of "medium".
    pub medium: f64,
    /// Degree of "high".
    pub high: f64,
}

impl MembershipDegrees {
    /// Sum of the three degrees.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn total(&self) -> f64 {
        self.low + self.medium + self.high
    }
}

/// What an estimate was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimateBasis {
    /// The vehicle count.
    pub count: u32,
    /// Whether rush-hour durations were used.
    pub rush_hour: bool,
}

/// A green duration and the inputs it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationEstimate {
    /// Green duration in seconds, never negative.
    pub seconds: f64,
    /// The inputs of the estimate.
    pub basis: EstimateBasis,
}

impl DurationEstimate {
    /// The estimate as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.seconds).unwrap_or(Duration::ZERO)
    }
}

/// Grade `count` against the three categories.
pub fn memberships(config: &FuzzyConfig, count: u32) -> MembershipDegrees {
    let x = f64::from(count);
    MembershipDegrees {
        low: config.low.degree(x),
        medium: config.medium.degree(x),
        high: config.high.degree(x),
    }
}

/// Compute the green duration for `count`.
///
/// Falls back to the regime's fallback duration when no category has any
/// membership.
#[allow(clippy::arithmetic_side_effects)]
pub fn defuzzify(config: &FuzzyConfig, count: u32, rush_hour: bool) -> DurationEstimate {
    let table = if rush_hour { &config.rush } else { &config.normal };
    let degrees = memberships(config, count);
    let total = degrees.total();
    let seconds = if total <= 0.0 {
        table.fallback
    } else {
        (degrees.low * table.short + degrees.medium * table.medium + degrees.high * table.long)
            / total
    };
    DurationEstimate {
        seconds: seconds.max(0.0),
        basis: EstimateBasis { count, rush_hour },
    }
}

/// The longest green any count can receive under `config`.
pub fn max_green(config: &FuzzyConfig) -> Duration {
    let longest = config.normal.max().max(config.rush.max());
    Duration::try_from_secs_f64(longest).unwrap_or(Duration::ZERO)
}

/// Whether `hour` (0-23) is inside either rush window.
pub const fn is_rush_hour(config: &RushHourConfig, hour: u32) -> bool {
    config.morning.contains(hour) || config.evening.contains(hour)
}

/// Hour of the day at the intersection's UTC offset.
pub fn local_hour(at: DateTime<Utc>, offset: FixedOffset) -> u32 {
    at.with_timezone(&offset).hour()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn default_memberships_match_breakpoints() {
        let config = FuzzyConfig::default();
        let two = memberships(&config, 2);
        assert!(close(two.low, 1.0) && close(two.medium, 0.0) && close(two.high, 0.0));

        let four = memberships(&config, 4);
        assert!(close(four.low, 0.5) && close(four.medium, 0.5) && close(four.high, 0.0));

        let eight = memberships(&config, 8);
        assert!(close(eight.low, 0.0) && close(eight.medium, 0.4) && close(eight.high, 0.6));

        let many = memberships(&config, 250);
        assert!(close(many.high, 1.0) && close(many.total(), 1.0));
    }

    #[test]
    fn two_vehicles_off_peak_get_short_green() {
        let estimate = defuzzify(&FuzzyConfig::default(), 2, false);
        assert!(close(estimate.seconds, 10.0));
        assert_eq!(estimate.basis, EstimateBasis { count: 2, rush_hour: false });
    }

    #[test]
    fn eight_vehicles_get_longer_green_in_rush_hour() {
        let config = FuzzyConfig::default();
        let rush = defuzzify(&config, 8, true);
        let normal = defuzzify(&config, 8, false);
        assert!(close(rush.seconds, 48.0));
        assert!(close(normal.seconds, 32.0));
        assert!(rush.seconds > normal.seconds);
    }

    #[test]
    fn empty_lane_uses_fallback() {
        let config = FuzzyConfig::default();
        assert!(close(defuzzify(&config, 0, false).seconds, 20.0));
        assert!(close(defuzzify(&config, 0, true).seconds, 30.0));
    }

    #[test]
    fn defuzzify_is_idempotent_and_non_negative() {
        let config = FuzzyConfig::default();
        for count in 0..=200 {
            for rush in [false, true] {
                let first = defuzzify(&config, count, rush);
                let second = defuzzify(&config, count, rush);
                assert_eq!(first.seconds, second.seconds);
                assert!(first.seconds >= 0.0);
            }
        }
    }

    #[test]
    fn duration_is_continuous_away_from_zero() {
        let config = FuzzyConfig::default();
        for rush in [false, true] {
            let mut previous = defuzzify(&config, 1, rush).seconds;
            for count in 2..=50 {
                let current = defuzzify(&config, count, rush).seconds;
                // Each unit step moves at most one ramp's worth of the base range.
                assert!((current - previous).abs() <= 12.0, "jump at {count}");
                previous = current;
            }
        }
    }

    #[test]
    fn open_shoulder_never_falls() {
        let high = Trapezoid::open(5.0, 10.0);
        assert!(high.is_open());
        assert!(close(high.degree(7.5), 0.5));
        assert!(close(high.degree(1e6), 1.0));
        assert!(close(high.degree(5.0), 0.0));
    }

    #[test]
    fn degenerate_ramp_is_a_step() {
        let step = Trapezoid::closed(3.0, 3.0, 6.0, 6.0);
        assert!(close(step.degree(3.0), 0.0));
        assert!(close(step.degree(3.5), 1.0));
        assert!(close(step.degree(6.0), 1.0));
        assert!(close(step.degree(6.5), 0.0));
    }

    #[test]
    fn half_open_trapezoid_is_rejected() {
        let bad = Trapezoid { start: 0.0, peak_start: 1.0, peak_end: Some(2.0), end: None };
        assert!(bad.check("low").is_err());
        let unordered = Trapezoid::closed(3.0, 1.0, 4.0, 5.0);
        assert!(unordered.check("low").is_err());
        assert!(Trapezoid::closed(0.0, 1.0, 3.0, 5.0).check("low").is_ok());
    }

    #[test]
    fn rush_hours_are_inclusive() {
        let config = RushHourConfig::default();
        for hour in [7, 8, 9, 17, 18, 19] {
            assert!(is_rush_hour(&config, hour), "hour {hour}");
        }
        for hour in [0, 6, 10, 12, 16, 20, 23] {
            assert!(!is_rush_hour(&config, hour), "hour {hour}");
        }
    }

    #[test]
    fn local_hour_applies_offset() {
        let at = DateTime::parse_from_rfc3339("2025-04-22T01:30:00Z").unwrap().with_timezone(&Utc);
        let jakarta = FixedOffset::east_opt(25_200).unwrap();
        assert_eq!(local_hour(at, jakarta), 8);
        assert_eq!(local_hour(at, FixedOffset::east_opt(0).unwrap()), 1);
    }

    #[test]
    fn max_green_covers_both_tables() {
        assert_eq!(max_green(&FuzzyConfig::default()), Duration::from_secs(60));
    }
}
