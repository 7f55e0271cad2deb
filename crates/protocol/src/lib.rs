//! # TestHub Protocol Library
//!
//! Shared data model for the TestHub daemon and its clients.
//!
//! ## Overview
//!
//! A *session* tracks one build's test run. Remote runners publish
//! [`TestEvent`]s on a per-session topic; the daemon keeps an ordered log of
//! them while the session is open and archives everything once it finishes.
//!
//! ```text
//!   runner ──tests/{id}/result──▶ relay ──▶ session log ──▶ archive
//!                                   │
//!                                   └──▶ live viewers
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use protocol::{topic, TestEvent, TestStatus};
//!
//! let session = topic::session_from_result_topic("tests/abc123/result").unwrap();
//! assert_eq!(session, "abc123");
//!
//! let event = TestEvent::parse(br#"{"test_name":"boot","status":"pass"}"#, Utc::now()).unwrap();
//! assert_eq!(event.status, TestStatus::Pass);
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Session records, status, active-time accounting, archive records
//! - [`event`]: Test result events and payload validation
//! - [`topic`]: Topic parsing and construction
//! - [`notification`]: Lifecycle notifications
//! - [`error`]: Error types

pub mod error;
pub mod event;
pub mod notification;
pub mod session;
pub mod topic;

pub use error::{ProtocolError, Result};
pub use event::{TestEvent, TestStatus};
pub use notification::{LifecycleKind, LifecycleNotification};
pub use session::{seconds_between, ArchiveRecord, EventSummary, SessionRecord, SessionStatus};
