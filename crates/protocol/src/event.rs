//! Test result events published by remote test runners.
//!
//! Payloads are JSON objects. `test_name` and `status` are required;
//! `metrics` is an open map of primitive values and `timestamp` defaults to
//! the time the relay received the message.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Outcome reported for a single test.
///
/// `pass` and `fail` are the known outcomes; any other string is preserved
/// verbatim so runners can report states this hub does not interpret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TestStatus {
    Pass,
    Fail,
    Pending,
    Other(String),
}

impl TestStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Pending => "pending",
            TestStatus::Other(s) => s,
        }
    }
}

impl From<String> for TestStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pass" => TestStatus::Pass,
            "fail" => TestStatus::Fail,
            "pending" => TestStatus::Pending,
            _ => TestStatus::Other(s),
        }
    }
}

impl From<TestStatus> for String {
    fn from(status: TestStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted test result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    pub test_name: String,
    pub status: TestStatus,
    /// Opaque metric values; only primitives are accepted.
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Loosely-typed shape of an inbound payload, validated into [`TestEvent`].
#[derive(Debug, Deserialize)]
struct RawTestEvent {
    test_name: Option<String>,
    status: Option<String>,
    #[serde(default)]
    metrics: Option<serde_json::Map<String, Value>>,
    timestamp: Option<String>,
}

impl TestEvent {
    /// Creates an event with no metrics.
    pub fn new(test_name: impl Into<String>, status: TestStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            test_name: test_name.into(),
            status,
            metrics: BTreeMap::new(),
            timestamp,
        }
    }

    /// Adds a metric value.
    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    /// Parses and validates a raw publisher payload.
    ///
    /// `received_at` is used when the payload carries no timestamp.
    pub fn parse(payload: &[u8], received_at: DateTime<Utc>) -> Result<Self> {
        let raw: RawTestEvent = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::MalformedEvent(e.to_string()))?;

        let test_name = raw
            .test_name
            .filter(|name| !name.trim().is_empty())
            .ok_or(ProtocolError::MissingField("test_name"))?;
        let status = raw
            .status
            .filter(|status| !status.trim().is_empty())
            .ok_or(ProtocolError::MissingField("status"))?;

        let mut metrics = BTreeMap::new();
        for (key, value) in raw.metrics.unwrap_or_default() {
            if value.is_object() || value.is_array() {
                return Err(ProtocolError::NonPrimitiveMetric { key });
            }
            metrics.insert(key, value);
        }

        let timestamp = match raw.timestamp {
            Some(ts) => parse_timestamp(&ts)?,
            None => received_at,
        };

        Ok(Self {
            test_name,
            status: TestStatus::from(status),
            metrics,
            timestamp,
        })
    }

    /// Serializes the event to its canonical JSON form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decodes an event previously produced by [`TestEvent::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Accepts RFC 3339 timestamps, and naive ISO-8601 timestamps as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ProtocolError::MalformedEvent(format!("invalid timestamp: {}", raw)))
}
