//! Configuration loading and typed config structures for a lane controller.
//!
//! The configuration lives in `crossway-config.yaml`. Every lane of an
//! intersection must run with the same file: the fuzzy breakpoints, rush
//! windows and timing all feed decisions that peers assume are identical.
//! The lane identity itself is not part of the file; it is given to each
//! process separately.

use std::path::Path;
use std::time::Duration;

use chrono::FixedOffset;
use crossway_types::LaneRing;
use serde::Deserialize;

use crate::fuzzy::{DurationTable, HourWindow, Trapezoid};

/// Tolerance used when checking that adjacent trapezoids share breakpoints.
const BREAKPOINT_TOLERANCE: f64 = 1e-9;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level controller configuration.
///
/// Mirrors the structure of `crossway-config.yaml`. Every field has a
/// default, so an empty file is a valid four-lane configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ControllerConfig {
    /// Shape of the intersection.
    #[serde(default)]
    pub intersection: IntersectionConfig,

    /// Membership functions and base durations.
    #[serde(default)]
    pub fuzzy: FuzzyConfig,

    /// Peak-traffic windows.
    #[serde(default)]
    pub rush_hour: RushHourConfig,

    /// Protocol and phase timers.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Behavioural switches.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Bus connection settings.
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ControllerConfig {
    /// Load and validate configuration from a YAML file.
    ///
    /// Environment variables override the bus settings:
    /// - `NATS_URL` overrides `infrastructure.nats_url`
    /// - `CROSSWAY_SUBJECT_PREFIX` overrides `infrastructure.subject_prefix`
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.infrastructure.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-field constraint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.intersection.check().map_err(invalid)?;
        self.fuzzy.check().map_err(invalid)?;
        self.rush_hour.check().map_err(invalid)?;
        self.timing.check().map_err(invalid)?;
        self.policy.check(self.intersection.lane_count).map_err(invalid)?;
        if self.infrastructure.subject_prefix.is_empty() {
            return Err(invalid("infrastructure.subject_prefix must not be empty".to_owned()));
        }
        Ok(())
    }
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::Invalid { reason }
}

/// Intersection shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct IntersectionConfig {
    /// Number of lanes taking turns.
    #[serde(default = "default_lane_count")]
    pub lane_count: u32,

    /// Local UTC offset in seconds, used for rush hours and detector
    /// timestamps without a zone.
    #[serde(default = "default_utc_offset_seconds")]
    pub utc_offset_seconds: i32,
}

impl IntersectionConfig {
    /// The lane ring, or `None` if `lane_count` is zero.
    pub const fn ring(&self) -> Option<LaneRing> {
        LaneRing::new(self.lane_count)
    }

    /// The local offset, or `None` if it is out of range.
    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_seconds)
    }

    fn check(&self) -> Result<(), String> {
        if self.ring().is_none() {
            return Err("intersection.lane_count must be at least 1".to_owned());
        }
        if self.offset().is_none() {
            return Err(format!(
                "intersection.utc_offset_seconds {} is outside +/- 24h",
                self.utc_offset_seconds
            ));
        }
        Ok(())
    }
}

impl Default for IntersectionConfig {
    fn default() -> Self {
        Self {
            lane_count: default_lane_count(),
            utc_offset_seconds: default_utc_offset_seconds(),
        }
    }
}

/// Fuzzy engine parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FuzzyConfig {
    /// "Low" density membership.
    #[serde(default = "default_low")]
    pub low: Trapezoid,

    /// "Medium" density membership.
    #[serde(default = "default_medium")]
    pub medium: Trapezoid,

    /// "High" density membership (open right shoulder).
    #[serde(default = "default_high")]
    pub high: Trapezoid,

    /// Base durations outside rush hour.
    #[serde(default = "default_normal_durations")]
    pub normal: DurationTable,

    /// Base durations during rush hour.
    #[serde(default = "default_rush_durations")]
    pub rush: DurationTable,
}

impl FuzzyConfig {
    /// Each category must fall exactly where the next one rises, and the
    /// last one must never fall.
    fn check(&self) -> Result<(), String> {
        self.low.check("fuzzy.low")?;
        self.medium.check("fuzzy.medium")?;
        self.high.check("fuzzy.high")?;
        self.normal.check("fuzzy.normal")?;
        self.rush.check("fuzzy.rush")?;

        let (Some(low_peak_end), Some(low_end)) = (self.low.peak_end, self.low.end) else {
            return Err("fuzzy.low must fall back to zero".to_owned());
        };
        let (Some(medium_peak_end), Some(medium_end)) = (self.medium.peak_end, self.medium.end)
        else {
            return Err("fuzzy.medium must fall back to zero".to_owned());
        };
        if !self.high.is_open() {
            return Err("fuzzy.high must have an open right shoulder".to_owned());
        }
        let seams = [
            ("fuzzy.low.peak_end", low_peak_end, "fuzzy.medium.start", self.medium.start),
            ("fuzzy.low.end", low_end, "fuzzy.medium.peak_start", self.medium.peak_start),
            ("fuzzy.medium.peak_end", medium_peak_end, "fuzzy.high.start", self.high.start),
            ("fuzzy.medium.end", medium_end, "fuzzy.high.peak_start", self.high.peak_start),
        ];
        for (left_name, left, right_name, right) in seams {
            if !same_breakpoint(left, right) {
                return Err(format!("{left_name} ({left}) must equal {right_name} ({right})"));
            }
        }
        Ok(())
    }
}

#[allow(clippy::arithmetic_side_effects)]
fn same_breakpoint(a: f64, b: f64) -> bool {
    (a - b).abs() <= BREAKPOINT_TOLERANCE
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            low: default_low(),
            medium: default_medium(),
            high: default_high(),
            normal: default_normal_durations(),
            rush: default_rush_durations(),
        }
    }
}

/// Peak-traffic windows, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RushHourConfig {
    /// Morning peak.
    #[serde(default = "default_morning")]
    pub morning: HourWindow,

    /// Evening peak.
    #[serde(default = "default_evening")]
    pub evening: HourWindow,
}

impl RushHourConfig {
    fn check(&self) -> Result<(), String> {
        for (name, window) in [("morning", self.morning), ("evening", self.evening)] {
            if window.end > 23 {
                return Err(format!("rush_hour.{name}.end must be at most 23"));
            }
            if window.start > window.end {
                return Err(format!("rush_hour.{name} starts after it ends"));
            }
        }
        if self.morning.end >= self.evening.start {
            return Err("rush_hour.morning must end before rush_hour.evening starts".to_owned());
        }
        Ok(())
    }
}

impl Default for RushHourConfig {
    fn default() -> Self {
        Self {
            morning: default_morning(),
            evening: default_evening(),
        }
    }
}

/// Protocol and phase timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimingConfig {
    /// Interval between controller ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How long a request waits for grants before it is released.
    #[serde(default = "default_grant_timeout_ms")]
    pub grant_timeout_ms: u64,

    /// Yellow phase length.
    #[serde(default = "default_yellow_ms")]
    pub yellow_ms: u64,

    /// Pause after a released or aborted request before asking again.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long a lane holds a turn it has no traffic for before passing it.
    #[serde(default = "default_turn_pass_after_ms")]
    pub turn_pass_after_ms: u64,

    /// Interval between repeats of a turn hand-over.
    #[serde(default = "default_handover_repeat_interval_ms")]
    pub handover_repeat_interval_ms: u64,

    /// Number of hand-over repeats after the first announcement.
    #[serde(default = "default_handover_repeats")]
    pub handover_repeats: u32,

    /// Vehicle counts older than this are ignored.
    #[serde(default = "default_observation_max_age_secs")]
    pub observation_max_age_secs: u64,

    /// Whether a peer's green is forgotten after the longest possible cycle.
    #[serde(default = "default_true")]
    pub green_lease_enabled: bool,

    /// Slack added to the longest possible cycle before a green is forgotten.
    #[serde(default = "default_green_lease_margin_ms")]
    pub green_lease_margin_ms: u64,
}

impl TimingConfig {
    /// Tick interval.
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Grant timeout.
    pub const fn grant_timeout(&self) -> Duration {
        Duration::from_millis(self.grant_timeout_ms)
    }

    /// Yellow phase length.
    pub const fn yellow(&self) -> Duration {
        Duration::from_millis(self.yellow_ms)
    }

    /// Retry backoff.
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Idle time on an empty turn before it is passed on.
    pub const fn turn_pass_after(&self) -> Duration {
        Duration::from_millis(self.turn_pass_after_ms)
    }

    /// Hand-over repeat interval.
    pub const fn handover_repeat_interval(&self) -> Duration {
        Duration::from_millis(self.handover_repeat_interval_ms)
    }

    /// Staleness threshold for vehicle counts.
    pub const fn observation_max_age(&self) -> Duration {
        Duration::from_secs(self.observation_max_age_secs)
    }

    /// Green lease margin.
    pub const fn green_lease_margin(&self) -> Duration {
        Duration::from_millis(self.green_lease_margin_ms)
    }

    fn check(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("timing.tick_interval_ms must be positive".to_owned());
        }
        if self.grant_timeout_ms == 0 {
            return Err("timing.grant_timeout_ms must be positive".to_owned());
        }
        if self.observation_max_age_secs == 0 {
            return Err("timing.observation_max_age_secs must be positive".to_owned());
        }
        Ok(())
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            grant_timeout_ms: default_grant_timeout_ms(),
            yellow_ms: default_yellow_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            turn_pass_after_ms: default_turn_pass_after_ms(),
            handover_repeat_interval_ms: default_handover_repeat_interval_ms(),
            handover_repeats: default_handover_repeats(),
            observation_max_age_secs: default_observation_max_age_secs(),
            green_lease_enabled: true,
            green_lease_margin_ms: default_green_lease_margin_ms(),
        }
    }
}

/// Behavioural switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PolicyConfig {
    /// Whether a count of zero still earns the lane a green phase.
    #[serde(default)]
    pub serve_empty_lanes: bool,

    /// Grants from distinct peers needed to confirm a request.
    #[serde(default = "default_grants_required")]
    pub grants_required: u32,
}

impl PolicyConfig {
    /// Grants needed in a ring of `lane_count` lanes. A lone lane has no
    /// peers and confirms its own requests.
    pub const fn effective_grants(&self, lane_count: u32) -> u32 {
        if lane_count <= 1 { 0 } else { self.grants_required }
    }

    fn check(&self, lane_count: u32) -> Result<(), String> {
        if lane_count <= 1 {
            return Ok(());
        }
        if self.grants_required == 0 {
            return Err("policy.grants_required must be at least 1 with peers".to_owned());
        }
        if self.grants_required >= lane_count {
            return Err(format!(
                "policy.grants_required {} exceeds the {} peers available",
                self.grants_required,
                lane_count.saturating_sub(1)
            ));
        }
        Ok(())
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            serve_empty_lanes: false,
            grants_required: default_grants_required(),
        }
    }
}

/// Bus connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfrastructureConfig {
    /// NATS messaging URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Subject prefix; every topic is published as `<prefix>.<topic>`.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl InfrastructureConfig {
    /// Override bus settings with environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("NATS_URL") {
            self.nats_url = val;
        }
        if let Ok(val) = std::env::var("CROSSWAY_SUBJECT_PREFIX") {
            self.subject_prefix = val;
        }
    }
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (required by serde's `default = "..."` attribute)
// ---------------------------------------------------------------------------

const fn default_lane_count() -> u32 {
    4
}

const fn default_utc_offset_seconds() -> i32 {
    25_200
}

const fn default_low() -> Trapezoid {
    Trapezoid::closed(0.0, 1.0, 3.0, 5.0)
}

const fn default_medium() -> Trapezoid {
    Trapezoid::closed(3.0, 5.0, 5.0, 10.0)
}

const fn default_high() -> Trapezoid {
    Trapezoid::open(5.0, 10.0)
}

const fn default_normal_durations() -> DurationTable {
    DurationTable::NORMAL
}

const fn default_rush_durations() -> DurationTable {
    DurationTable::RUSH
}

const fn default_morning() -> HourWindow {
    HourWindow { start: 7, end: 9 }
}

const fn default_evening() -> HourWindow {
    HourWindow { start: 17, end: 19 }
}

const fn default_tick_interval_ms() -> u64 {
    100
}

const fn default_grant_timeout_ms() -> u64 {
    5_000
}

const fn default_yellow_ms() -> u64 {
    2_000
}

const fn default_retry_backoff_ms() -> u64 {
    1_000
}

const fn default_turn_pass_after_ms() -> u64 {
    3_000
}

const fn default_handover_repeat_interval_ms() -> u64 {
    2_000
}

const fn default_handover_repeats() -> u32 {
    2
}

const fn default_observation_max_age_secs() -> u64 {
    120
}

const fn default_green_lease_margin_ms() -> u64 {
    5_000
}

const fn default_grants_required() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_owned()
}

fn default_subject_prefix() -> String {
    "traffic".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}
