//! Time sources for the lane controller.
//!
//! The controller needs two notions of time:
//!
//! - a monotonic instant for every local timer (grant timeout, green
//!   countdown, yellow, backoff, lease), and
//! - wall-clock time for staleness checks and rush-hour detection, which
//!   assumes every node's clock is loosely synchronized.
//!
//! Timers are plain [`Deadline`] values compared against the monotonic clock
//! on each tick. Nothing sleeps, so tests drive time with a [`ManualClock`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};

/// A source of monotonic and wall-clock time.
pub trait Clock {
    /// Current monotonic instant.
    fn monotonic(&self) -> Instant;

    /// Current wall-clock time.
    fn wall(&self) -> DateTime<Utc>;
}

/// The operating system's clocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same offset, so one handle can advance time for every
/// controller in a simulation.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    offset_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock whose wall time starts at `wall_origin`.
    pub fn new(wall_origin: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin,
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move both clocks forward by `by` (millisecond resolution).
    pub fn advance(&self, by: Duration) {
        let step = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        // The closure never returns None, so the update cannot fail.
        let _ = self
            .offset_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ms| Some(ms.saturating_add(step)));
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Instant {
        self.origin.checked_add(self.elapsed()).unwrap_or(self.origin)
    }

    fn wall(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.elapsed())
            .ok()
            .and_then(|delta| self.wall_origin.checked_add_signed(delta))
            .unwrap_or(self.wall_origin)
    }
}

/// A point in monotonic time after which something is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `wait` after `now`.
    pub fn after(now: Instant, wait: Duration) -> Self {
        Self {
            at: now.checked_add(wait).unwrap_or(now),
        }
    }

    /// The instant at which the deadline falls due.
    pub const fn at(self) -> Instant {
        self.at
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_due(self, now: Instant) -> bool {
        now >= self.at
    }

    /// Time left until the deadline, zero once it is due.
    pub fn remaining(self, now: Instant) -> Duration {
        self.at.saturating_duration_since(now)
    }
}

/// Round a duration up to whole seconds.
pub fn ceil_secs(duration: Duration) -> u64 {
    let partial = u64::from(duration.subsec_nanos() > 0);
    duration.as_secs().saturating_add(partial)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-04-22T03:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn manual_clock_moves_both_time_lines() {
        let clock = ManualClock::new(epoch());
        let start = clock.monotonic();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.monotonic().duration_since(start), Duration::from_millis(1500));
        assert_eq!(clock.wall(), epoch() + TimeDelta::milliseconds(1500));
    }

    #[test]
    fn clones_share_time() {
        let clock = ManualClock::new(epoch());
        let other = clock.clone();
        clock.advance(Duration::from_secs(3));
        assert_eq!(other.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn deadline_falls_due_exactly_at_wait() {
        let clock = ManualClock::new(epoch());
        let deadline = Deadline::after(clock.monotonic(), Duration::from_secs(5));
        clock.advance(Duration::from_millis(4999));
        assert!(!deadline.is_due(clock.monotonic()));
        assert_eq!(deadline.remaining(clock.monotonic()), Duration::from_millis(1));
        clock.advance(Duration::from_millis(1));
        assert!(deadline.is_due(clock.monotonic()));
        assert_eq!(deadline.remaining(clock.monotonic()), Duration::ZERO);
    }

    #[test]
    fn ceil_secs_rounds_up_partial_seconds() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(10)), 10);
        assert_eq!(ceil_secs(Duration::from_millis(10_001)), 11);
    }
}
