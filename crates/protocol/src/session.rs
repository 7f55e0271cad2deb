//! Session records and active-time accounting.
//!
//! A [`SessionRecord`] is the mutable state of one build's test run while it
//! is open. Once finished it is frozen into an [`ArchiveRecord`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::event::{TestEvent, TestStatus};

/// Field names used when a record is flattened into a key-value hash.
pub mod fields {
    pub const SESSION_ID: &str = "session_id";
    pub const BUILD_NUMBER: &str = "build_number";
    pub const OPERATOR: &str = "operator";
    pub const STATUS: &str = "status";
    pub const START_TIME: &str = "start_time";
    pub const LAST_ACTIVE_START: &str = "last_active_start";
    pub const TOTAL_ACTIVE_SECONDS: &str = "total_active_seconds";
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accruing active time.
    Active,
    /// Paused; active time is frozen.
    Pending,
    /// Finished and archived. Terminal.
    Completed,
}

impl SessionStatus {
    /// Returns the lowercase wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Pending => "pending",
            SessionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "pending" => Ok(SessionStatus::Pending),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// Seconds elapsed from `start` to `end`, never negative.
pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let micros = (end - start).num_microseconds().unwrap_or(i64::MAX);
    (micros.max(0) as f64) / 1_000_000.0
}

/// The state of one open test session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque unique identifier, generated at creation.
    pub session_id: String,
    /// Business key. At most one open session per build number.
    pub build_number: String,
    /// Free-text operator name.
    pub operator: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// When the session was created.
    pub start_time: DateTime<Utc>,
    /// When the session last became active; `None` while pending.
    pub last_active_start: Option<DateTime<Utc>>,
    /// Active time accrued before `last_active_start`.
    pub total_active_seconds: f64,
}

impl SessionRecord {
    /// Creates a fresh active record starting at `now`.
    pub fn new_active(
        session_id: impl Into<String>,
        build_number: impl Into<String>,
        operator: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            build_number: build_number.into(),
            operator: operator.into(),
            status: SessionStatus::Active,
            start_time: now,
            last_active_start: Some(now),
            total_active_seconds: 0.0,
        }
    }

    /// Active time as it should be displayed at `now`.
    ///
    /// While active this is the frozen total plus the running interval since
    /// `last_active_start`; while pending it is the frozen total alone.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> f64 {
        match (self.status, self.last_active_start) {
            (SessionStatus::Active, Some(since)) => {
                self.total_active_seconds + seconds_between(since, now)
            }
            _ => self.total_active_seconds,
        }
    }

    /// Flattens the record into hash fields.
    ///
    /// `last_active_start` is encoded as fractional epoch seconds, with `0`
    /// meaning unset.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (fields::SESSION_ID.to_string(), self.session_id.clone()),
            (fields::BUILD_NUMBER.to_string(), self.build_number.clone()),
            (fields::OPERATOR.to_string(), self.operator.clone()),
            (fields::STATUS.to_string(), self.status.as_str().to_string()),
            (fields::START_TIME.to_string(), self.start_time.to_rfc3339()),
            (
                fields::LAST_ACTIVE_START.to_string(),
                encode_instant(self.last_active_start),
            ),
            (
                fields::TOTAL_ACTIVE_SECONDS.to_string(),
                self.total_active_seconds.to_string(),
            ),
        ]
    }

    /// Rebuilds a record from hash fields written by [`SessionRecord::to_fields`].
    pub fn from_fields(map: &HashMap<String, String>) -> Result<Self> {
        let get = |field: &'static str| {
            map.get(field)
                .cloned()
                .ok_or(ProtocolError::MissingField(field))
        };

        let start_raw = get(fields::START_TIME)?;
        let start_time = DateTime::parse_from_rfc3339(&start_raw)
            .map_err(|_| ProtocolError::InvalidField {
                field: fields::START_TIME,
                value: start_raw.clone(),
            })?
            .with_timezone(&Utc);

        let total_raw = get(fields::TOTAL_ACTIVE_SECONDS)?;
        let total_active_seconds =
            total_raw
                .parse::<f64>()
                .map_err(|_| ProtocolError::InvalidField {
                    field: fields::TOTAL_ACTIVE_SECONDS,
                    value: total_raw.clone(),
                })?;

        let last_raw = map
            .get(fields::LAST_ACTIVE_START)
            .map(String::as_str)
            .unwrap_or("0");

        Ok(Self {
            session_id: get(fields::SESSION_ID)?,
            build_number: get(fields::BUILD_NUMBER)?,
            operator: get(fields::OPERATOR)?,
            status: get(fields::STATUS)?.parse()?,
            start_time,
            last_active_start: decode_instant(last_raw)?,
            total_active_seconds,
        })
    }
}

/// Encodes an optional instant as fractional epoch seconds ("0" for unset).
pub fn encode_instant(instant: Option<DateTime<Utc>>) -> String {
    match instant {
        Some(ts) => (ts.timestamp_micros() as f64 / 1_000_000.0).to_string(),
        None => "0".to_string(),
    }
}

fn decode_instant(raw: &str) -> Result<Option<DateTime<Utc>>> {
    let invalid = || ProtocolError::InvalidField {
        field: fields::LAST_ACTIVE_START,
        value: raw.to_string(),
    };
    let secs = raw.parse::<f64>().map_err(|_| invalid())?;
    if secs <= 0.0 {
        return Ok(None);
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
        .map(Some)
        .ok_or_else(invalid)
}

/// Pass/fail tally of a session's event log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub other: usize,
}

impl EventSummary {
    /// Tallies a sequence of events.
    pub fn from_events(events: &[TestEvent]) -> Self {
        events.iter().fold(Self::default(), |mut acc, event| {
            acc.total += 1;
            match event.status {
                TestStatus::Pass => acc.passed += 1,
                TestStatus::Fail => acc.failed += 1,
                _ => acc.other += 1,
            }
            acc
        })
    }
}

/// The final, write-once record of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// The session fields, with `status = completed`.
    #[serde(flatten)]
    pub session: SessionRecord,
    /// Final accrued active time.
    pub total_duration_seconds: f64,
    /// When the session was finished.
    pub completed_at: DateTime<Utc>,
    /// Tally of the drained event log.
    pub summary: EventSummary,
    /// The drained event log, in arrival order.
    pub events: Vec<TestEvent>,
}

impl ArchiveRecord {
    /// Freezes an open record into its archived form.
    pub fn complete(
        mut session: SessionRecord,
        total_duration_seconds: f64,
        completed_at: DateTime<Utc>,
        events: Vec<TestEvent>,
    ) -> Self {
        session.status = SessionStatus::Completed;
        session.last_active_start = None;
        session.total_active_seconds = total_duration_seconds;
        Self {
            summary: EventSummary::from_events(&events),
            session,
            total_duration_seconds,
            completed_at,
            events,
        }
    }
}
