//! # TestHub Daemon Library
//!
//! This crate tracks test sessions for builds and relays live test results
//! to connected viewers.
//!
//! ## Overview
//!
//! - **Session Lifecycle**: start, pause, resume and finish sessions with
//!   accurate active-time accounting
//! - **Session Store**: TTL-bound records reachable by build number or session id
//! - **Event Relay**: validate published results, log them and fan them out
//! - **Archive**: durable, write-once records of finished sessions
//! - **Control Surfaces**: WebSocket and Unix socket IPC
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────────┐   ┌──────────────────┐  │
//! │  │ IPC Server │──▶│ Request Router │──▶│    Lifecycle     │  │
//! │  └────────────┘   └────────────────┘   │     Manager      │  │
//! │                                        └──────────────────┘  │
//! │  ┌────────────┐   ┌────────────────┐     │      │      │     │
//! │  │ WebSocket  │──▶│  Event Relay   │──▶ Store  Archive Notifier
//! │  └────────────┘   └────────────────┘     │                   │
//! │        ▲                  │              │                   │
//! │        └──── Connection Registry ◀───────┘                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`clock`]: Wall-clock abstraction
//! - [`store`]: Session store over an in-process key-value engine
//! - [`lifecycle`]: Session state machine
//! - [`relay`]: Event ingestion and viewer fan-out
//! - [`archive`]: Completed-session archive and build catalog
//! - [`notify`]: Lifecycle notifications
//! - [`network`]: WebSocket transport
//! - [`ipc`]: CLI control socket
//! - [`router`]: IPC request routing
//! - [`orchestrator`]: Main daemon coordinator

pub mod archive;
pub mod clock;
pub mod config;
pub mod ipc;
pub mod lifecycle;
pub mod network;
pub mod notify;
pub mod orchestrator;
pub mod relay;
pub mod router;
pub mod store;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use archive::{Archive, ArchiveError, FileArchive};
pub use clock::{Clock, ManualClock, SystemClock};
pub use lifecycle::{LifecycleError, SessionLifecycleManager, StartKind};
pub use notify::{BroadcastNotifier, Notifier};
pub use relay::{ConnectionRegistry, EventRelay, FeedMessage, FeedSender};
pub use store::{KvSessionStore, SessionStore, StoreError};

pub use router::{RequestRouter, RouterError, RouterResult};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
