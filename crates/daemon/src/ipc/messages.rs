//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types used for communication
//! between the CLI and the daemon over Unix Domain Sockets.

use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// Start a session for a build, or reconnect to the open one.
    StartSession {
        build_number: String,
        operator: String,
    },
    /// Pause an active session.
    PauseSession { session_id: String },
    /// Resume a paused session.
    ResumeSession { session_id: String },
    /// Finish and archive a session.
    FinishSession { session_id: String },
    /// Show one open session.
    GetSession { session_id: String },
    /// List all open sessions.
    ListSessions,
    /// Inject a message into the result feed.
    Publish {
        topic: String,
        /// Raw JSON payload.
        payload: String,
    },
    /// Add a build number to the build catalog.
    RegisterBuild { build_number: String },
}

/// Classification of an error response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IpcErrorKind {
    /// The session or build does not exist.
    NotFound,
    /// The request raced with another that won.
    Conflict,
    /// The request itself was invalid.
    Malformed,
    /// A backing store could not be reached.
    Unavailable,
    /// Anything else.
    Internal,
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of open sessions.
        session_count: usize,
        /// Number of connected live viewers.
        viewer_count: usize,
        /// WebSocket listen address.
        listen_addr: Option<String>,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Result of a start request.
    SessionStarted {
        /// False when an open session was reused.
        created: bool,
        session: IpcSessionInfo,
        message: Option<String>,
    },
    /// Result of a pause or resume request.
    SessionUpdated {
        session: IpcSessionInfo,
        /// False when the session was already in the requested state.
        changed: bool,
        message: Option<String>,
    },
    /// Confirmation that a session was archived.
    SessionFinished {
        session_id: String,
        build_number: String,
        total_duration_seconds: f64,
        events: usize,
    },
    /// One open session.
    Session { session: IpcSessionInfo },
    /// List of open sessions.
    Sessions {
        /// Information about each open session.
        sessions: Vec<IpcSessionInfo>,
    },
    /// Whether a published message was queued.
    Published { accepted: bool },
    /// Confirmation of a build registration.
    BuildRegistered {
        build_number: String,
        /// False if the build was already known.
        created: bool,
    },
    /// An error occurred processing the request.
    Error {
        kind: IpcErrorKind,
        /// Human-readable error message.
        message: String,
    },
}

impl IpcResponse {
    /// Builds an error response.
    pub fn error(kind: IpcErrorKind, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Information about an open session for IPC communication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    pub session_id: String,
    pub build_number: String,
    pub operator: String,
    /// `active` or `pending`.
    pub status: String,
    /// RFC 3339 creation time.
    pub start_time: String,
    /// Displayed active time.
    pub elapsed_seconds: f64,
    /// Number of logged events.
    pub event_count: usize,
    /// Number of live viewers.
    pub viewer_count: usize,
}
