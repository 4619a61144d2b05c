//! Gate for inbound vehicle counts.
//!
//! A count is dropped when it is older than the staleness threshold or when
//! it repeats the last accepted count exactly (same lane, count and
//! timestamp), which is what a replayed or re-delivered message looks like.
//! Only fresh counts reach the coordination logic.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossway_types::{LaneId, VehicleReport};

/// Identity of an observation for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObservationKey {
    /// Lane the count belongs to.
    pub lane: LaneId,
    /// The count.
    pub count: u32,
    /// Detector timestamp.
    pub timestamp: DateTime<Utc>,
}

impl From<&VehicleReport> for ObservationKey {
    fn from(report: &VehicleReport) -> Self {
        Self {
            lane: report.lane,
            count: report.count,
            timestamp: report.timestamp,
        }
    }
}

/// A vehicle count accepted by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleObservation {
    /// The decoded report.
    pub report: VehicleReport,
    /// Local monotonic time at which the report was handled.
    pub received_at: Instant,
}

impl VehicleObservation {
    /// Vehicles waiting.
    pub const fn count(&self) -> u32 {
        self.report.count
    }

    /// Duplicate-detection key.
    pub fn key(&self) -> ObservationKey {
        ObservationKey::from(&self.report)
    }

    /// Whether the report is older than `max_age` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        is_stale(self.report.timestamp, now, max_age)
    }
}

/// Outcome of classifying a vehicle count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New data; it replaces the pending observation.
    Fresh,
    /// Older than the staleness threshold.
    Stale,
    /// Identical to the last accepted observation.
    Duplicate,
}

/// Remembers the last accepted observation and the staleness threshold.
#[derive(Debug, Clone)]
pub struct FreshnessFilter {
    max_age: Duration,
    last_accepted: Option<ObservationKey>,
}

impl FreshnessFilter {
    /// A filter with no history.
    pub const fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            last_accepted: None,
        }
    }

    /// Classify `report` without recording it.
    pub fn classify(&self, report: &VehicleReport, now: DateTime<Utc>) -> Verdict {
        if is_stale(report.timestamp, now, self.max_age) {
            Verdict::Stale
        } else if self.last_accepted == Some(ObservationKey::from(report)) {
            Verdict::Duplicate
        } else {
            Verdict::Fresh
        }
    }

    /// Classify `report` and remember it if it is fresh.
    pub fn admit(&mut self, report: &VehicleReport, now: DateTime<Utc>) -> Verdict {
        let verdict = self.classify(report, now);
        if verdict == Verdict::Fresh {
            self.last_accepted = Some(ObservationKey::from(report));
        }
        verdict
    }

    /// The most recently accepted observation key.
    pub const fn last_accepted(&self) -> Option<ObservationKey> {
        self.last_accepted
    }

    /// Forget the history.
    pub const fn clear(&mut self) {
        self.last_accepted = None;
    }
}

/// Whether `timestamp` is more than `max_age` before `now`.
///
/// Timestamps ahead of `now` (clock skew between detector and controller)
/// count as fresh.
pub fn is_stale(timestamp: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    now.signed_duration_since(timestamp)
        .to_std()
        .is_ok_and(|age| age > max_age)
}
