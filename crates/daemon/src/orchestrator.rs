//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that initializes and coordinates
//! all daemon subsystems: the session store and its sweeper, the archive,
//! the lifecycle manager, the event relay, and the WebSocket and IPC servers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::FileArchive;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::ipc::IpcServer;
use crate::lifecycle::SessionLifecycleManager;
use crate::network::{WebSocketServer, WsState};
use crate::notify::{BroadcastNotifier, DEFAULT_NOTIFY_CAPACITY};
use crate::relay::{ConnectionRegistry, EventRelay, FeedMessage, FeedSender};
use crate::router::{DaemonLifecycle, RequestRouter};
use crate::store::{KvSessionStore, MemoryKv};

/// Close reason sent to viewers when the daemon stops.
const SHUTDOWN_REASON: &str = "Daemon shutting down";

/// How long `stop` waits for each background task.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    store: Arc<KvSessionStore>,
    archive: Arc<FileArchive>,
    notifier: Arc<BroadcastNotifier>,
    registry: Arc<ConnectionRegistry>,
    lifecycle: Arc<DaemonLifecycle<KvSessionStore>>,
    relay: Arc<EventRelay<KvSessionStore>>,
    feed: FeedSender,
    /// Consumed by the relay task on start.
    feed_rx: Option<mpsc::Receiver<FeedMessage>>,
    /// Bound WebSocket address once running.
    ws_addr: Option<SocketAddr>,
    /// Background tasks joined on stop.
    tasks: Vec<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator using the system clock.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a new daemon orchestrator with an injected clock.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let archive_dir = config.archive_dir();
        let archive = Arc::new(
            FileArchive::open(&archive_dir)
                .with_context(|| format!("Failed to open archive: {}", archive_dir.display()))?,
        );

        let store = Arc::new(KvSessionStore::new(
            Arc::new(MemoryKv::new()),
            config.session_ttl(),
        ));
        let notifier = Arc::new(BroadcastNotifier::new(DEFAULT_NOTIFY_CAPACITY));
        let registry = Arc::new(ConnectionRegistry::with_capacity(
            config.relay.viewer_channel_capacity,
        ));

        let lifecycle = Arc::new(SessionLifecycleManager::new(
            Arc::clone(&store),
            Arc::clone(&archive),
            Arc::clone(&notifier),
            Arc::clone(&registry),
            Arc::clone(&clock),
        ));
        let relay = Arc::new(EventRelay::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            clock,
        ));
        let (feed, feed_rx) = FeedSender::channel(config.relay.feed_capacity);

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            store,
            archive,
            notifier,
            registry,
            lifecycle,
            relay,
            feed,
            feed_rx: Some(feed_rx),
            ws_addr: None,
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    async fn set_state(&self, next: OrchestratorState) {
        *self.state.write().await = next;
        self.emit_event(OrchestratorEvent::StateChanged(next));
    }

    /// Starts the daemon orchestrator.
    ///
    /// Both listeners are bound before any task is spawned, so a bind
    /// failure leaves the orchestrator stopped.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        match self.spawn_components().await {
            Ok(()) => {
                self.set_state(OrchestratorState::Running).await;
                info!(
                    ws_addr = ?self.ws_addr,
                    socket = %self.socket_path().display(),
                    "Daemon orchestrator started successfully"
                );
                Ok(())
            }
            Err(e) => {
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("{:#}", e),
                });
                self.set_state(OrchestratorState::Stopped).await;
                Err(e)
            }
        }
    }

    async fn spawn_components(&mut self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("Orchestrator cannot be restarted after shutdown");
        }

        let listen_addr = self.config.listen_addr()?;
        let ws_state = Arc::new(WsState {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            feed: self.feed.clone(),
            notifier: Arc::clone(&self.notifier),
        });
        let ws_server = WebSocketServer::bind(listen_addr, ws_state)
            .await
            .with_context(|| format!("Failed to bind WebSocket listener on {}", listen_addr))?;
        let ws_addr = ws_server.local_addr()?;

        let socket_path = self.socket_path();
        let ipc_server = IpcServer::bind(&socket_path)
            .await
            .with_context(|| format!("Failed to bind IPC socket: {}", socket_path.display()))?;

        let feed_rx = self
            .feed_rx
            .take()
            .context("Event feed already consumed")?;

        let token = self.shutdown_token.clone();

        self.tasks.push(
            self.store
                .start_sweeper(self.config.sweep_interval(), token.child_token()),
        );
        debug!("Started session store sweeper");

        let relay = Arc::clone(&self.relay);
        self.tasks
            .push(tokio::spawn(relay.run(feed_rx, token.child_token())));

        self.tasks
            .push(tokio::spawn(ws_server.run(token.child_token())));

        let router = Arc::new(
            RequestRouter::new(
                Arc::clone(&self.lifecycle),
                Arc::clone(&self.archive),
                self.feed.clone(),
                token.clone(),
            )
            .with_listen_addr(ws_addr.to_string()),
        );
        self.tasks
            .push(tokio::spawn(ipc_server.serve(router, token.child_token())));

        self.ws_addr = Some(ws_addr);
        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Open sessions are left as they are; live viewers are disconnected.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        let closed = self.registry.close_all(SHUTDOWN_REASON);
        debug!(viewers_closed = closed, "Closed live viewers");
        self.notifier.close();

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task failed"),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        self.set_state(OrchestratorState::Stopped).await;

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// The bound WebSocket address, once started.
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    /// The IPC socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<DaemonLifecycle<KvSessionStore>> {
        &self.lifecycle
    }

    pub fn store(&self) -> &Arc<KvSessionStore> {
        &self.store
    }

    pub fn archive(&self) -> &Arc<FileArchive> {
        &self.archive
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Arc<BroadcastNotifier> {
        &self.notifier
    }

    /// A producer handle for the result feed.
    pub fn feed(&self) -> FeedSender {
        self.feed.clone()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
