//! Publish/subscribe topic layout.
//!
//! Runners publish results on `tests/{session_id}/result`. Lifecycle
//! notifications go out on `hub/{session_id}/start` and
//! `tests/{session_id}/{pause|resume|finished}`.

/// Root segment shared by result and lifecycle topics.
pub const TESTS_ROOT: &str = "tests";

/// Root segment of the session-started notification.
pub const HUB_ROOT: &str = "hub";

/// Trailing segment of result topics.
pub const RESULT_SUFFIX: &str = "result";

/// Subscription filter for inbound results.
pub const RESULT_FILTER: &str = "tests/+/result";

/// Extracts the session identifier from a result topic.
///
/// Returns `None` for anything that is not exactly `tests/{id}/result` with a
/// non-empty, wildcard-free id.
pub fn session_from_result_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    let root = parts.next()?;
    let session_id = parts.next()?;
    let suffix = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if root != TESTS_ROOT || suffix != RESULT_SUFFIX {
        return None;
    }
    if session_id.is_empty() || session_id.contains(['+', '#']) {
        return None;
    }
    Some(session_id)
}

/// Builds the result topic for a session.
pub fn result_topic(session_id: &str) -> String {
    format!("{}/{}/{}", TESTS_ROOT, session_id, RESULT_SUFFIX)
}
