//! Viewer admission against concurrent pause and finish.
//!
//! The store used here can hold one `lookup_by_session` call until the test
//! releases it, which lets a transition run while a viewer is being admitted.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use daemon::clock::ManualClock;
use daemon::network::{WebSocketServer, WsState};
use daemon::store::SessionDelta;
use daemon::{
    BroadcastNotifier, ConnectionRegistry, FeedSender, FileArchive, KvSessionStore,
    SessionLifecycleManager, SessionStore, StoreError,
};
use futures_util::StreamExt;
use protocol::{SessionRecord, TestEvent};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Store whose next session lookup waits for `release` once armed.
#[derive(Default)]
struct GatedStore {
    inner: KvSessionStore,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl SessionStore for GatedStore {
    async fn create_if_absent(
        &self,
        build_number: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        self.inner.create_if_absent(build_number, operator, now).await
    }

    async fn lookup_by_build(&self, build_number: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.lookup_by_build(build_number).await
    }

    async fn lookup_by_session(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.lookup_by_session(session_id).await
    }

    async fn update(&self, session_id: &str, delta: SessionDelta) -> Result<SessionRecord, StoreError> {
        self.inner.update(session_id, delta).await
    }

    async fn append_event(&self, session_id: &str, event: &TestEvent) -> Result<usize, StoreError> {
        self.inner.append_event(session_id, event).await
    }

    async fn drain_events(&self, session_id: &str) -> Result<Vec<TestEvent>, StoreError> {
        self.inner.drain_events(session_id).await
    }

    async fn event_count(&self, session_id: &str) -> Result<usize, StoreError> {
        self.inner.event_count(session_id).await
    }

    async fn delete_session(&self, session_id: &str, build_number: &str) -> Result<(), StoreError> {
        self.inner.delete_session(session_id, build_number).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.list_sessions().await
    }
}

struct Harness {
    store: Arc<GatedStore>,
    registry: Arc<ConnectionRegistry>,
    manager: SessionLifecycleManager<GatedStore, FileArchive, BroadcastNotifier>,
    addr: SocketAddr,
    cancel: CancellationToken,
    _feed_rx: mpsc::Receiver<daemon::FeedMessage>,
    _dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let archive = FileArchive::open(dir.path()).unwrap();
        archive.register_build("1.0.0").unwrap();

        let store = Arc::new(GatedStore::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let notifier = Arc::new(BroadcastNotifier::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let manager = SessionLifecycleManager::new(
            Arc::clone(&store),
            Arc::new(archive),
            Arc::clone(&notifier),
            Arc::clone(&registry),
            clock,
        );

        let (feed, feed_rx) = FeedSender::channel(16);
        let state = Arc::new(WsState {
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            feed,
            notifier,
        });
        let server = WebSocketServer::bind("127.0.0.1:0".parse().unwrap(), state)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        Self {
            store,
            registry,
            manager,
            addr,
            cancel,
            _feed_rx: feed_rx,
            _dir: dir,
        }
    }

    async fn viewer(&self, session_id: &str) -> Ws {
        let url = format!("ws://{}/ws/{}", self.addr, session_id);
        let (ws, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    /// Connects a viewer and returns once its admission lookup is held.
    async fn viewer_held_at_lookup(&self, session_id: &str) -> Ws {
        self.store.armed.store(true, Ordering::SeqCst);
        let ws = self.viewer(session_id).await;
        tokio::time::timeout(WAIT, self.store.entered.notified())
            .await
            .expect("viewer never looked up its session");
        ws
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn expect_close(ws: &mut Ws, code: u16, reason: &str) {
    let frame = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(message)) => return message,
                other => panic!("stream ended: {:?}", other),
            }
        }
    })
    .await
    .expect("no frame in time");

    match frame {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), code);
            assert_eq!(frame.reason, reason);
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_finish_during_admission_closes_viewer() {
    let h = Harness::start().await;
    let id = h.manager.start("1.0.0", "qa1").await.unwrap().record.session_id;

    let mut ws = h.viewer_held_at_lookup(&id).await;
    let outcome = h.manager.finish(&id).await.unwrap();
    h.store.release.notify_one();

    assert_eq!(outcome.viewers_closed, 1);
    expect_close(&mut ws, 1000, "Session Finished").await;
    assert_eq!(h.registry.connection_count(&id), 0);
    assert_eq!(h.registry.session_count(), 0);
}

#[tokio::test]
async fn test_pause_during_admission_closes_viewer() {
    let h = Harness::start().await;
    let id = h.manager.start("1.0.0", "qa1").await.unwrap().record.session_id;

    let mut ws = h.viewer_held_at_lookup(&id).await;
    let outcome = h.manager.pause(&id).await.unwrap();
    h.store.release.notify_one();

    assert!(outcome.changed);
    expect_close(&mut ws, 1000, "Session Paused").await;
    assert_eq!(h.registry.session_count(), 0);
}

#[tokio::test]
async fn test_viewer_of_paused_session_is_turned_away() {
    let h = Harness::start().await;
    let id = h.manager.start("1.0.0", "qa1").await.unwrap().record.session_id;
    h.manager.pause(&id).await.unwrap();

    let mut ws = h.viewer(&id).await;
    expect_close(&mut ws, 1000, "Session Paused").await;
    assert_eq!(h.registry.session_count(), 0);

    h.manager.resume(&id).await.unwrap();
    let _ws = h.viewer(&id).await;
    tokio::time::timeout(WAIT, async {
        while h.registry.connection_count(&id) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("viewer not admitted after resume");
}

#[tokio::test]
async fn test_viewer_of_unknown_session_gets_policy_close() {
    let h = Harness::start().await;
    let mut ws = h.viewer("ghost").await;
    expect_close(&mut ws, 1008, "Session not found").await;
    assert_eq!(h.registry.session_count(), 0);
}
