//! Bus topics and the strict JSON codec for every payload.
//!
//! Each [`Topic`] maps to a subject `<prefix>.<name>`. Inbound payloads are
//! validated field by field: a missing field, a zero lane number, an unknown
//! status string, or an unparseable timestamp is a [`WireError`] and the
//! message is dropped by the caller. No default is ever substituted for a
//! missing field. Unknown extra fields are tolerated so that collaborators can
//! add diagnostics without breaking older controllers.
//!
//! Timestamps are accepted as RFC 3339, or as the detector's
//! `YYYY-MM-DD HH:MM:SS[.fff]` local time, which is interpreted at the
//! intersection's UTC offset. Outbound timestamps are always RFC 3339.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{LightStatus, SignalAspect};
use crate::ids::LaneId;
use crate::messages::{
    CoordinationMessage, CountdownSync, DurationReport, Inbound, Outbound, VehicleReport,
};

/// Local timestamp layouts the detector is known to emit.
const LOCAL_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Words that trigger a reset when sent on the reset topic.
const RESET_TRIGGERS: [&str; 3] = ["true", "reset", "1"];

/// Errors produced while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The payload bytes are not UTF-8 text.
    #[error("payload is not UTF-8: {source}")]
    Utf8 {
        /// The underlying UTF-8 error.
        #[from]
        source: std::str::Utf8Error,
    },

    /// The payload is not valid JSON for its topic.
    #[error("invalid JSON payload: {source}")]
    Json {
        /// The underlying serde error.
        #[from]
        source: serde_json::Error,
    },

    /// A field is present but its value is unusable.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The topic only ever carries outbound records.
    #[error("topic `{topic}` is not consumed by lane controllers")]
    NotInbound {
        /// The topic the payload arrived on.
        topic: Topic,
    },
}

/// Every topic on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Detector counts (inbound).
    VehicleCount,
    /// Green requests (peer broadcast).
    GreenRequest,
    /// Green grants (peer broadcast).
    GreenPermission,
    /// Green/red announcements (peer broadcast).
    GreenStatus,
    /// Turn hand-over (peer broadcast).
    NextLaneReady,
    /// Completed-cycle records (outbound).
    Duration,
    /// Operator reset (inbound).
    Reset,
    /// Countdown diagnostics (outbound).
    CountdownSync,
}

impl Topic {
    /// All topics, in a fixed order.
    pub const ALL: [Self; 8] = [
        Self::VehicleCount,
        Self::GreenRequest,
        Self::GreenPermission,
        Self::GreenStatus,
        Self::NextLaneReady,
        Self::Duration,
        Self::Reset,
        Self::CountdownSync,
    ];

    /// Subject suffix for this topic.
    pub const fn name(self) -> &'static str {
        match self {
            Self::VehicleCount => "vehicle_count",
            Self::GreenRequest => "green_request",
            Self::GreenPermission => "green_permission",
            Self::GreenStatus => "green_status",
            Self::NextLaneReady => "next_lane_ready",
            Self::Duration => "duration",
            Self::Reset => "reset",
            Self::CountdownSync => "countdown_sync",
        }
    }

    /// Whether lane controllers consume this topic.
    pub const fn is_inbound(self) -> bool {
        !matches!(self, Self::Duration | Self::CountdownSync)
    }

    /// Full subject under `prefix`, e.g. `traffic.green_status`.
    pub fn subject(self, prefix: &str) -> String {
        format!("{prefix}.{}", self.name())
    }

    /// Resolve a subject back to its topic. Returns `None` for subjects
    /// outside `prefix` or with an unknown suffix.
    pub fn from_subject(prefix: &str, subject: &str) -> Option<Self> {
        let suffix = subject.strip_prefix(prefix)?.strip_prefix('.')?;
        Self::ALL.into_iter().find(|topic| topic.name() == suffix)
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct VehicleCountPayload {
    road_section_id: LaneId,
    total_vehicles: Option<u32>,
    vehicle_counts: Option<BTreeMap<String, u32>>,
    timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GreenRequestPayload {
    section: LaneId,
    timestamp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Permission {
    Granted,
}

#[derive(Debug, Serialize, Deserialize)]
struct GreenPermissionPayload {
    section: LaneId,
    permission: Permission,
    from_section: LaneId,
}

#[derive(Debug, Serialize, Deserialize)]
struct GreenStatusPayload {
    section: LaneId,
    status: LightStatus,
    timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NextLaneReadyPayload {
    next_expected_section: LaneId,
    from_lane: LaneId,
    /// Present when a peer skipped `from_lane` on its behalf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skipped_by: Option<LaneId>,
}

#[derive(Debug, Serialize)]
struct DurationPayload {
    road_section_id: LaneId,
    total_vehicles: u32,
    duration: f64,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct CountdownSyncPayload<'a> {
    lane_id: LaneId,
    remaining_seconds: u64,
    phase: SignalAspect,
    source: &'a str,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a payload received on `topic`.
///
/// `offset` is the intersection's local UTC offset, used for detector
/// timestamps that carry no zone.
///
/// # Errors
///
/// Returns [`WireError`] if the payload is not valid for the topic.
pub fn decode(topic: Topic, payload: &[u8], offset: FixedOffset) -> Result<Inbound, WireError> {
    let text = std::str::from_utf8(payload)?;
    let message = match topic {
        Topic::VehicleCount => return decode_vehicle_count(text, offset).map(Inbound::Vehicles),
        Topic::GreenRequest => {
            let p: GreenRequestPayload = serde_json::from_str(text)?;
            CoordinationMessage::GreenRequest {
                lane: p.section,
                requested_at: parse_timestamp(&p.timestamp, offset)?,
            }
        }
        Topic::GreenPermission => {
            let p: GreenPermissionPayload = serde_json::from_str(text)?;
            let Permission::Granted = p.permission;
            CoordinationMessage::GreenGrant { to_lane: p.section, from_lane: p.from_section }
        }
        Topic::GreenStatus => {
            let p: GreenStatusPayload = serde_json::from_str(text)?;
            CoordinationMessage::GreenStatus {
                lane: p.section,
                status: p.status,
                at: parse_timestamp(&p.timestamp, offset)?,
            }
        }
        Topic::NextLaneReady => {
            let p: NextLaneReadyPayload = serde_json::from_str(text)?;
            match p.skipped_by {
                Some(by_lane) => CoordinationMessage::TurnSkipped {
                    next_expected_lane: p.next_expected_section,
                    silent_lane: p.from_lane,
                    by_lane,
                },
                None => CoordinationMessage::NextLaneReady {
                    next_expected_lane: p.next_expected_section,
                    from_lane: p.from_lane,
                },
            }
        }
        Topic::Reset => {
            decode_reset(text)?;
            CoordinationMessage::Reset
        }
        Topic::Duration | Topic::CountdownSync => return Err(WireError::NotInbound { topic }),
    };
    Ok(Inbound::Coordination(message))
}

fn decode_vehicle_count(text: &str, offset: FixedOffset) -> Result<VehicleReport, WireError> {
    let p: VehicleCountPayload = serde_json::from_str(text)?;
    let count = match (p.total_vehicles, p.vehicle_counts) {
        (Some(total), _) => total,
        (None, Some(per_class)) => per_class
            .values()
            .try_fold(0_u32, |sum, n| sum.checked_add(*n))
            .ok_or_else(|| WireError::InvalidField {
                field: "vehicle_counts",
                reason: "sum overflows".to_owned(),
            })?,
        (None, None) => {
            return Err(WireError::InvalidField {
                field: "total_vehicles",
                reason: "neither total_vehicles nor vehicle_counts is present".to_owned(),
            });
        }
    };
    Ok(VehicleReport {
        lane: p.road_section_id,
        count,
        timestamp: parse_timestamp(&p.timestamp, offset)?,
    })
}

/// Accept `true`, `1`, or one of the trigger words, bare or JSON-encoded.
fn decode_reset(text: &str) -> Result<(), WireError> {
    let trimmed = text.trim();
    let word = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Bool(flag)) => flag.to_string(),
        Ok(serde_json::Value::Number(n)) => n.to_string(),
        Ok(serde_json::Value::String(s)) => s,
        Ok(_) => String::new(),
        Err(_) => trimmed.to_owned(),
    };
    let word = word.trim().to_ascii_lowercase();
    if RESET_TRIGGERS.contains(&word.as_str()) {
        Ok(())
    } else {
        Err(WireError::InvalidField {
            field: "reset",
            reason: format!("`{trimmed}` is not a reset trigger"),
        })
    }
}

/// Parse an RFC 3339 timestamp, or a zone-less local one at `offset`.
///
/// # Errors
///
/// Returns [`WireError::InvalidField`] if no accepted layout matches.
pub fn parse_timestamp(raw: &str, offset: FixedOffset) -> Result<DateTime<Utc>, WireError> {
    if let Ok(stamped) = DateTime::parse_from_rfc3339(raw) {
        return Ok(stamped.with_timezone(&Utc));
    }
    LOCAL_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| WireError::InvalidField {
            field: "timestamp",
            reason: format!("`{raw}` is neither RFC 3339 nor YYYY-MM-DD HH:MM:SS"),
        })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode an outbound message into its topic and JSON payload.
///
/// # Errors
///
/// Returns [`WireError::Json`] if serialization fails (for example a
/// non-finite duration).
pub fn encode(message: &Outbound) -> Result<(Topic, Vec<u8>), WireError> {
    let encoded = match message {
        Outbound::Coordination(coordination) => return encode_coordination(coordination),
        Outbound::Duration(report) => (Topic::Duration, encode_duration(report)?),
        Outbound::Countdown(countdown) => (Topic::CountdownSync, encode_countdown(countdown)?),
    };
    Ok(encoded)
}

fn encode_coordination(message: &CoordinationMessage) -> Result<(Topic, Vec<u8>), WireError> {
    let encoded = match *message {
        CoordinationMessage::GreenRequest { lane, requested_at } => (
            Topic::GreenRequest,
            serde_json::to_vec(&GreenRequestPayload {
                section: lane,
                timestamp: format_timestamp(requested_at),
            })?,
        ),
        CoordinationMessage::GreenGrant { to_lane, from_lane } => (
            Topic::GreenPermission,
            serde_json::to_vec(&GreenPermissionPayload {
                section: to_lane,
                permission: Permission::Granted,
                from_section: from_lane,
            })?,
        ),
        CoordinationMessage::GreenStatus { lane, status, at } => (
            Topic::GreenStatus,
            serde_json::to_vec(&GreenStatusPayload {
                section: lane,
                status,
                timestamp: format_timestamp(at),
            })?,
        ),
        CoordinationMessage::NextLaneReady { next_expected_lane, from_lane } => (
            Topic::NextLaneReady,
            serde_json::to_vec(&NextLaneReadyPayload {
                next_expected_section: next_expected_lane,
                from_lane,
                skipped_by: None,
            })?,
        ),
        CoordinationMessage::TurnSkipped { next_expected_lane, silent_lane, by_lane } => (
            Topic::NextLaneReady,
            serde_json::to_vec(&NextLaneReadyPayload {
                next_expected_section: next_expected_lane,
                from_lane: silent_lane,
                skipped_by: Some(by_lane),
            })?,
        ),
        CoordinationMessage::Reset => (Topic::Reset, serde_json::to_vec(&true)?),
    };
    Ok(encoded)
}

fn encode_duration(report: &DurationReport) -> Result<Vec<u8>, WireError> {
    if !report.duration_seconds.is_finite() {
        return Err(WireError::InvalidField {
            field: "duration",
            reason: "duration must be finite".to_owned(),
        });
    }
    Ok(serde_json::to_vec(&DurationPayload {
        road_section_id: report.lane,
        total_vehicles: report.total_vehicles,
        duration: report.duration_seconds,
        timestamp: format_timestamp(report.timestamp),
    })?)
}

fn encode_countdown(countdown: &CountdownSync) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(&CountdownSyncPayload {
        lane_id: countdown.lane,
        remaining_seconds: countdown.remaining_seconds,
        phase: countdown.phase,
        source: &countdown.source,
    })?)
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
