//! Request router for the CLI control surface.
//!
//! `RequestRouter` receives [`IpcRequest`]s and dispatches them to the
//! subsystem that owns them: session transitions go to the lifecycle
//! manager, build registration to the archive catalog, published results to
//! the relay feed.

use std::sync::Arc;
use std::time::Instant;

use protocol::topic;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveError, FileArchive};
use crate::ipc::{IpcErrorKind, IpcRequest, IpcResponse, IpcSessionInfo, RequestHandler};
use crate::lifecycle::{LifecycleError, SessionLifecycleManager, SessionView, StartKind};
use crate::notify::BroadcastNotifier;
use crate::relay::{ConnectionRegistry, FeedMessage, FeedSender};
use crate::store::{SessionStore, StoreError};

/// Lifecycle manager as wired by the daemon.
pub type DaemonLifecycle<S> = SessionLifecycleManager<S, FileArchive, BroadcastNotifier>;

/// Result type for router operations.
pub type RouterResult = Result<IpcResponse, RouterError>;

/// Errors that can occur while routing a request.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Lifecycle transition failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Session store error outside a transition.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Build catalog error.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Classifies the error for the client.
    pub fn kind(&self) -> IpcErrorKind {
        match self {
            RouterError::Lifecycle(e) => match e {
                LifecycleError::NotFound(_) => IpcErrorKind::NotFound,
                LifecycleError::Conflict(_) => IpcErrorKind::Conflict,
                LifecycleError::StoreUnavailable(_) => IpcErrorKind::Unavailable,
                LifecycleError::Archive(_) => IpcErrorKind::Internal,
            },
            RouterError::Store(StoreError::NotFound(_)) => IpcErrorKind::NotFound,
            RouterError::Store(StoreError::Conflict(_)) => IpcErrorKind::Conflict,
            RouterError::Store(_) => IpcErrorKind::Unavailable,
            RouterError::Archive(_) => IpcErrorKind::Internal,
            RouterError::InvalidRequest(_) => IpcErrorKind::Malformed,
        }
    }

    /// Converts the error to an error response.
    pub fn to_response(&self) -> IpcResponse {
        IpcResponse::error(self.kind(), self.to_string())
    }
}

fn require(field: &str, value: &str) -> Result<(), RouterError> {
    if value.trim().is_empty() {
        return Err(RouterError::InvalidRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Routes control requests to the daemon's subsystems.
pub struct RequestRouter<S: SessionStore> {
    lifecycle: Arc<DaemonLifecycle<S>>,
    catalog: Arc<FileArchive>,
    feed: FeedSender,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    started_at: Instant,
    listen_addr: Option<String>,
}

impl<S: SessionStore> RequestRouter<S> {
    pub fn new(
        lifecycle: Arc<DaemonLifecycle<S>>,
        catalog: Arc<FileArchive>,
        feed: FeedSender,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::clone(lifecycle.registry());
        Self {
            lifecycle,
            catalog,
            feed,
            registry,
            shutdown,
            started_at: Instant::now(),
            listen_addr: None,
        }
    }

    /// Sets the address reported by `Status`.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Routes a request to the appropriate handler.
    pub async fn route(&self, request: IpcRequest) -> RouterResult {
        match request {
            IpcRequest::Ping => Ok(IpcResponse::Pong),
            IpcRequest::Status => self.handle_status().await,
            IpcRequest::Stop => Ok(self.handle_stop()),
            IpcRequest::StartSession {
                build_number,
                operator,
            } => self.handle_start(&build_number, &operator).await,
            IpcRequest::PauseSession { session_id } => self.handle_pause(&session_id).await,
            IpcRequest::ResumeSession { session_id } => self.handle_resume(&session_id).await,
            IpcRequest::FinishSession { session_id } => self.handle_finish(&session_id).await,
            IpcRequest::GetSession { session_id } => self.handle_get(&session_id).await,
            IpcRequest::ListSessions => self.handle_list().await,
            IpcRequest::Publish { topic, payload } => self.handle_publish(topic, payload),
            IpcRequest::RegisterBuild { build_number } => self.handle_register_build(&build_number),
        }
    }

    async fn session_info(&self, view: SessionView) -> Result<IpcSessionInfo, RouterError> {
        let session_id = view.record.session_id.clone();
        let event_count = self.lifecycle.store().event_count(&session_id).await?;
        Ok(IpcSessionInfo {
            viewer_count: self.registry.connection_count(&session_id),
            session_id,
            build_number: view.record.build_number,
            operator: view.record.operator,
            status: view.record.status.as_str().to_string(),
            start_time: view.record.start_time.to_rfc3339(),
            elapsed_seconds: view.elapsed_seconds,
            event_count,
        })
    }

    async fn handle_status(&self) -> RouterResult {
        let sessions = self.lifecycle.store().list_sessions().await?;
        Ok(IpcResponse::Status {
            running: !self.shutdown.is_cancelled(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            session_count: sessions.len(),
            viewer_count: self.registry.total_connections(),
            listen_addr: self.listen_addr.clone(),
        })
    }

    fn handle_stop(&self) -> IpcResponse {
        info!("Stop requested over IPC");
        self.shutdown.cancel();
        IpcResponse::Stopping
    }

    async fn handle_start(&self, build_number: &str, operator: &str) -> RouterResult {
        require("build_number", build_number)?;
        require("operator", operator)?;

        let outcome = self.lifecycle.start(build_number, operator).await?;
        let created = outcome.kind == StartKind::Created;
        let session = self
            .session_info(SessionView {
                record: outcome.record,
                elapsed_seconds: outcome.elapsed_seconds,
            })
            .await?;
        Ok(IpcResponse::SessionStarted {
            created,
            session,
            message: outcome.message,
        })
    }

    async fn handle_pause(&self, session_id: &str) -> RouterResult {
        require("session_id", session_id)?;
        let outcome = self.lifecycle.pause(session_id).await?;
        let session = self
            .session_info(SessionView {
                record: outcome.record,
                elapsed_seconds: outcome.elapsed_seconds,
            })
            .await?;
        Ok(IpcResponse::SessionUpdated {
            session,
            changed: outcome.changed,
            message: outcome.message,
        })
    }

    async fn handle_resume(&self, session_id: &str) -> RouterResult {
        require("session_id", session_id)?;
        let outcome = self.lifecycle.resume(session_id).await?;
        let session = self
            .session_info(SessionView {
                record: outcome.record,
                elapsed_seconds: outcome.elapsed_seconds,
            })
            .await?;
        Ok(IpcResponse::SessionUpdated {
            session,
            changed: outcome.changed,
            message: outcome.message,
        })
    }

    async fn handle_finish(&self, session_id: &str) -> RouterResult {
        require("session_id", session_id)?;
        let outcome = self.lifecycle.finish(session_id).await?;
        Ok(IpcResponse::SessionFinished {
            session_id: outcome.session_id,
            build_number: outcome.build_number,
            total_duration_seconds: outcome.total_duration_seconds,
            events: outcome.events,
        })
    }

    async fn handle_get(&self, session_id: &str) -> RouterResult {
        require("session_id", session_id)?;
        let view = self.lifecycle.status(session_id).await?;
        Ok(IpcResponse::Session {
            session: self.session_info(view).await?,
        })
    }

    async fn handle_list(&self) -> RouterResult {
        let views = self.lifecycle.list().await?;
        let mut sessions = Vec::with_capacity(views.len());
        for view in views {
            match self.session_info(view).await {
                Ok(info) => sessions.push(info),
                // Finished between the list and the count.
                Err(RouterError::Store(StoreError::NotFound(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(IpcResponse::Sessions { sessions })
    }

    fn handle_publish(&self, topic_name: String, payload: String) -> RouterResult {
        if topic::session_from_result_topic(&topic_name).is_none() {
            return Err(RouterError::InvalidRequest(format!(
                "not a result topic: {}",
                topic_name
            )));
        }
        let accepted = self.feed.offer(FeedMessage::new(topic_name, payload));
        Ok(IpcResponse::Published { accepted })
    }

    fn handle_register_build(&self, build_number: &str) -> RouterResult {
        require("build_number", build_number)?;
        let created = self.catalog.register_build(build_number)?;
        if created {
            info!(build_number = %build_number, "Build registered");
        } else {
            debug!(build_number = %build_number, "Build already registered");
        }
        Ok(IpcResponse::BuildRegistered {
            build_number: build_number.to_string(),
            created,
        })
    }
}

impl<S: SessionStore> RequestHandler for RequestRouter<S> {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match self.route(request).await {
            Ok(response) => response,
            Err(e) => {
                if e.kind() == IpcErrorKind::Internal || e.kind() == IpcErrorKind::Unavailable {
                    warn!(error = %e, "Request failed");
                } else {
                    debug!(error = %e, "Request rejected");
                }
                e.to_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::KvSessionStore;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct TestRouter {
        router: RequestRouter<KvSessionStore>,
        clock: Arc<ManualClock>,
        catalog: Arc<FileArchive>,
        feed_rx: mpsc::Receiver<FeedMessage>,
        shutdown: CancellationToken,
        _dir: TempDir,
    }

    fn create_test_router() -> TestRouter {
        create_test_router_with_feed(16)
    }

    fn create_test_router_with_feed(capacity: usize) -> TestRouter {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(FileArchive::open(dir.path()).unwrap());
        catalog.register_build("1.0.0").unwrap();

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let lifecycle = Arc::new(SessionLifecycleManager::new(
            Arc::new(KvSessionStore::in_memory()),
            Arc::clone(&catalog),
            Arc::new(BroadcastNotifier::default()),
            Arc::new(ConnectionRegistry::new()),
            clock.clone(),
        ));
        let (feed, feed_rx) = FeedSender::channel(capacity);
        let shutdown = CancellationToken::new();
        let router = RequestRouter::new(lifecycle, Arc::clone(&catalog), feed, shutdown.clone())
            .with_listen_addr("127.0.0.1:8000");

        TestRouter {
            router,
            clock,
            catalog,
            feed_rx,
            shutdown,
            _dir: dir,
        }
    }

    async fn start(t: &TestRouter, build: &str) -> IpcSessionInfo {
        match t
            .router
            .route(IpcRequest::StartSession {
                build_number: build.into(),
                operator: "qa1".into(),
            })
            .await
            .unwrap()
        {
            IpcResponse::SessionStarted { session, .. } => session,
            other => panic!("unexpected response: {:?}", other),
        }
    }

    fn error_kind(result: RouterResult) -> IpcErrorKind {
        match result {
            Err(e) => e.kind(),
            Ok(response) => panic!("expected error, got {:?}", response),
        }
    }

    #[tokio::test]
    async fn test_route_ping() {
        let t = create_test_router();
        assert_eq!(t.router.route(IpcRequest::Ping).await.unwrap(), IpcResponse::Pong);
    }

    #[tokio::test]
    async fn test_route_status_counts_sessions() {
        let t = create_test_router();
        start(&t, "1.0.0").await;

        match t.router.route(IpcRequest::Status).await.unwrap() {
            IpcResponse::Status {
                running,
                session_count,
                viewer_count,
                listen_addr,
                ..
            } => {
                assert!(running);
                assert_eq!(session_count, 1);
                assert_eq!(viewer_count, 0);
                assert_eq!(listen_addr.as_deref(), Some("127.0.0.1:8000"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_stop_cancels_shutdown_token() {
        let t = create_test_router();
        assert_eq!(t.router.route(IpcRequest::Stop).await.unwrap(), IpcResponse::Stopping);
        assert!(t.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_start_then_reconnect() {
        let t = create_test_router();
        let first = start(&t, "1.0.0").await;
        assert_eq!(first.status, "active");
        assert_eq!(first.elapsed_seconds, 0.0);

        t.clock.advance_secs(30);
        let response = t
            .router
            .route(IpcRequest::StartSession {
                build_number: "1.0.0".into(),
                operator: "qa2".into(),
            })
            .await
            .unwrap();
        match response {
            IpcResponse::SessionStarted {
                created,
                session,
                message,
            } => {
                assert!(!created);
                assert_eq!(session.session_id, first.session_id);
                assert_eq!(session.operator, "qa1");
                assert_eq!(session.elapsed_seconds, 30.0);
                assert_eq!(message.as_deref(), Some("Reconnected to active session."));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_unknown_build_is_not_found() {
        let t = create_test_router();
        let result = t
            .router
            .route(IpcRequest::StartSession {
                build_number: "9.9.9".into(),
                operator: "qa1".into(),
            })
            .await;
        assert_eq!(error_kind(result), IpcErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_empty_fields_are_malformed() {
        let t = create_test_router();
        let result = t
            .router
            .route(IpcRequest::StartSession {
                build_number: " ".into(),
                operator: "qa1".into(),
            })
            .await;
        assert_eq!(error_kind(result), IpcErrorKind::Malformed);

        let result = t
            .router
            .route(IpcRequest::PauseSession {
                session_id: String::new(),
            })
            .await;
        assert_eq!(error_kind(result), IpcErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_pause_resume_through_router() {
        let t = create_test_router();
        let session = start(&t, "1.0.0").await;

        t.clock.advance_secs(10);
        match t
            .router
            .route(IpcRequest::PauseSession {
                session_id: session.session_id.clone(),
            })
            .await
            .unwrap()
        {
            IpcResponse::SessionUpdated {
                session, changed, ..
            } => {
                assert!(changed);
                assert_eq!(session.status, "pending");
                assert_eq!(session.elapsed_seconds, 10.0);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        t.clock.advance_secs(100);
        match t
            .router
            .route(IpcRequest::PauseSession {
                session_id: session.session_id.clone(),
            })
            .await
            .unwrap()
        {
            IpcResponse::SessionUpdated {
                changed, message, ..
            } => {
                assert!(!changed);
                assert_eq!(message.as_deref(), Some("Already paused"));
            }
            other => panic!("unexpected response: {:?}", other),
        }

        match t
            .router
            .route(IpcRequest::ResumeSession {
                session_id: session.session_id.clone(),
            })
            .await
            .unwrap()
        {
            IpcResponse::SessionUpdated {
                session, changed, ..
            } => {
                assert!(changed);
                assert_eq!(session.status, "active");
                assert_eq!(session.elapsed_seconds, 10.0);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let t = create_test_router();
        for request in [
            IpcRequest::PauseSession {
                session_id: "missing".into(),
            },
            IpcRequest::ResumeSession {
                session_id: "missing".into(),
            },
            IpcRequest::FinishSession {
                session_id: "missing".into(),
            },
            IpcRequest::GetSession {
                session_id: "missing".into(),
            },
        ] {
            assert_eq!(error_kind(t.router.route(request).await), IpcErrorKind::NotFound);
        }
    }

    #[tokio::test]
    async fn test_finish_archives_and_removes() {
        let t = create_test_router();
        let session = start(&t, "1.0.0").await;
        t.clock.advance_secs(42);

        match t
            .router
            .route(IpcRequest::FinishSession {
                session_id: session.session_id.clone(),
            })
            .await
            .unwrap()
        {
            IpcResponse::SessionFinished {
                session_id,
                build_number,
                total_duration_seconds,
                events,
            } => {
                assert_eq!(session_id, session.session_id);
                assert_eq!(build_number, "1.0.0");
                assert_eq!(total_duration_seconds, 42.0);
                assert_eq!(events, 0);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let archived = t.catalog.read_record(&session.session_id).unwrap().unwrap();
        assert_eq!(archived.total_duration_seconds, 42.0);

        match t.router.route(IpcRequest::ListSessions).await.unwrap() {
            IpcResponse::Sessions { sessions } => assert!(sessions.is_empty()),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_and_list_sessions() {
        let t = create_test_router();
        t.catalog.register_build("2.0.0").unwrap();
        let first = start(&t, "1.0.0").await;
        t.clock.advance_secs(5);
        start(&t, "2.0.0").await;

        match t
            .router
            .route(IpcRequest::GetSession {
                session_id: first.session_id.clone(),
            })
            .await
            .unwrap()
        {
            IpcResponse::Session { session } => {
                assert_eq!(session.build_number, "1.0.0");
                assert_eq!(session.elapsed_seconds, 5.0);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        match t.router.route(IpcRequest::ListSessions).await.unwrap() {
            IpcResponse::Sessions { sessions } => {
                let builds: Vec<_> = sessions.iter().map(|s| s.build_number.as_str()).collect();
                assert_eq!(builds, vec!["1.0.0", "2.0.0"]);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_queues_feed_message() {
        let mut t = create_test_router();
        let response = t
            .router
            .route(IpcRequest::Publish {
                topic: "tests/abc/result".into(),
                payload: r#"{"test_name":"boot","status":"pass"}"#.into(),
            })
            .await
            .unwrap();
        assert_eq!(response, IpcResponse::Published { accepted: true });

        let message = t.feed_rx.recv().await.unwrap();
        assert_eq!(message.topic, "tests/abc/result");
        assert_eq!(message.payload, br#"{"test_name":"boot","status":"pass"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_publish_full_feed_is_not_accepted() {
        let t = create_test_router_with_feed(1);
        let publish = || IpcRequest::Publish {
            topic: "tests/abc/result".into(),
            payload: "{}".into(),
        };
        assert_eq!(
            t.router.route(publish()).await.unwrap(),
            IpcResponse::Published { accepted: true }
        );
        assert_eq!(
            t.router.route(publish()).await.unwrap(),
            IpcResponse::Published { accepted: false }
        );
    }

    #[tokio::test]
    async fn test_publish_rejects_non_result_topic() {
        let t = create_test_router();
        let result = t
            .router
            .route(IpcRequest::Publish {
                topic: "tests/abc/pause".into(),
                payload: "{}".into(),
            })
            .await;
        assert_eq!(error_kind(result), IpcErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_register_build_is_idempotent() {
        let t = create_test_router();
        assert_eq!(
            t.router
                .route(IpcRequest::RegisterBuild {
                    build_number: "3.0.0".into()
                })
                .await
                .unwrap(),
            IpcResponse::BuildRegistered {
                build_number: "3.0.0".into(),
                created: true
            }
        );
        assert_eq!(
            t.router
                .route(IpcRequest::RegisterBuild {
                    build_number: "3.0.0".into()
                })
                .await
                .unwrap(),
            IpcResponse::BuildRegistered {
                build_number: "3.0.0".into(),
                created: false
            }
        );
        start(&t, "3.0.0").await;
    }

    #[tokio::test]
    async fn test_handle_converts_errors_to_responses() {
        let t = create_test_router();
        let response = t
            .router
            .handle(IpcRequest::GetSession {
                session_id: "missing".into(),
            })
            .await;
        match response {
            IpcResponse::Error { kind, message } => {
                assert_eq!(kind, IpcErrorKind::NotFound);
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
