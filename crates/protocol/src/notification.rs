//! Outbound lifecycle notifications.

use serde::{Deserialize, Serialize};

use crate::session::SessionRecord;
use crate::topic::{HUB_ROOT, TESTS_ROOT};

/// Which lifecycle transition a notification announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Started,
    Paused,
    Resumed,
    Finished,
}

/// A fire-and-forget announcement of a session transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleNotification {
    pub kind: LifecycleKind,
    pub session_id: String,
    pub topic: String,
    /// JSON payload; the session record for `started`, `true` otherwise.
    pub payload: serde_json::Value,
}

impl LifecycleNotification {
    /// Announces a newly created session.
    pub fn started(record: &SessionRecord) -> Self {
        Self {
            kind: LifecycleKind::Started,
            session_id: record.session_id.clone(),
            topic: format!("{}/{}/start", HUB_ROOT, record.session_id),
            payload: serde_json::to_value(record).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn paused(session_id: &str) -> Self {
        Self::flag(LifecycleKind::Paused, session_id, "pause")
    }

    pub fn resumed(session_id: &str) -> Self {
        Self::flag(LifecycleKind::Resumed, session_id, "resume")
    }

    pub fn finished(session_id: &str) -> Self {
        Self::flag(LifecycleKind::Finished, session_id, "finished")
    }

    fn flag(kind: LifecycleKind, session_id: &str, action: &str) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            topic: format!("{}/{}/{}", TESTS_ROOT, session_id, action),
            payload: serde_json::Value::Bool(true),
        }
    }
}
