//! WebSocket transport.
//!
//! Routes:
//!
//! - `/ws/{session_id}`: live viewer of one active session. Receives every
//!   event relayed for the session as a JSON text frame until the session
//!   is paused or finished. Unknown sessions are closed with 1008, paused
//!   ones with a normal "Session Paused" closure.
//! - `/feed`: result publishers. Each text frame is
//!   `{"topic": "tests/{id}/result", "payload": {...}}`.
//! - `/notifications`: lifecycle notifications as JSON text frames.
//!
//! One task runs per connection.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use protocol::SessionStatus;

use crate::lifecycle::PAUSED_REASON;
use crate::notify::BroadcastNotifier;
use crate::relay::{close_code, ConnectionRegistry, FeedMessage, FeedSender, ViewerFrame};
use crate::store::SessionStore;

type WsStream = WebSocketStream<TcpStream>;

/// A parsed request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Viewer(String),
    Feed,
    Notifications,
    Unknown(String),
}

impl Route {
    /// Maps a request path to a route.
    pub fn parse(path: &str) -> Self {
        let trimmed = path.trim_end_matches('/');
        match trimmed {
            "/feed" => Route::Feed,
            "/notifications" => Route::Notifications,
            _ => match trimmed.strip_prefix("/ws/") {
                Some(id) if !id.is_empty() && !id.contains('/') => Route::Viewer(id.to_string()),
                _ => Route::Unknown(path.to_string()),
            },
        }
    }
}

/// One frame sent by a publisher on `/feed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFrame {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl FeedFrame {
    /// Converts the frame into a feed message.
    ///
    /// A string payload is taken as already-encoded JSON.
    pub fn into_message(self) -> Result<FeedMessage, serde_json::Error> {
        let payload = match self.payload {
            serde_json::Value::String(raw) => raw.into_bytes(),
            other => serde_json::to_vec(&other)?,
        };
        Ok(FeedMessage::new(self.topic, payload))
    }
}

/// Shared state handed to every connection task.
pub struct WsState<S: SessionStore> {
    pub store: Arc<S>,
    pub registry: Arc<ConnectionRegistry>,
    pub feed: FeedSender,
    pub notifier: Arc<BroadcastNotifier>,
}

/// WebSocket server for viewers, publishers and notification listeners.
pub struct WebSocketServer<S: SessionStore> {
    listener: TcpListener,
    state: Arc<WsState<S>>,
}

impl<S: SessionStore> WebSocketServer<S> {
    /// Binds the server. Use port 0 to pick a free port.
    pub async fn bind(addr: SocketAddr, state: Arc<WsState<S>>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    /// The bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "WebSocket server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&self.state);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            handle_connection(state, stream, peer, cancel).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept WebSocket connection");
                    }
                },
            }
        }
        tracing::info!("WebSocket server stopped");
    }
}

async fn handle_connection<S: SessionStore>(
    state: Arc<WsState<S>>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let mut path = String::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    match Route::parse(&path) {
        Route::Viewer(session_id) => serve_viewer(state, ws, session_id, cancel).await,
        Route::Feed => serve_feed(state, ws, peer, cancel).await,
        Route::Notifications => serve_notifications(state, ws, cancel).await,
        Route::Unknown(path) => {
            tracing::debug!(peer = %peer, path = %path, "Rejecting unknown WebSocket route");
            close_with(ws, close_code::POLICY, "Unknown route").await;
        }
    }
}

fn close_message(code: u16, reason: impl Into<Cow<'static, str>>) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

async fn close_with(mut ws: WsStream, code: u16, reason: impl Into<Cow<'static, str>>) {
    let _ = ws.send(close_message(code, reason)).await;
    let _ = ws.close(None).await;
}

async fn serve_viewer<S: SessionStore>(
    state: Arc<WsState<S>>,
    ws: WsStream,
    session_id: String,
    cancel: CancellationToken,
) {
    // Register before checking the session. A pause or finish that lands
    // in between either closes this viewer or is seen by the lookup.
    let (connection_id, mut frames) = state.registry.connect(&session_id);

    let rejection = match state.store.lookup_by_session(&session_id).await {
        Ok(record) if record.status == SessionStatus::Active => None,
        Ok(_) => Some((close_code::NORMAL, PAUSED_REASON.to_string())),
        Err(e) => {
            tracing::debug!(session_id = %session_id, error = %e, "Rejecting viewer");
            Some((close_code::POLICY, "Session not found".to_string()))
        }
    };
    if let Some((code, reason)) = rejection {
        state.registry.disconnect(&session_id, connection_id);
        // Prefer the reason of a forced close that already reached us.
        let (code, reason) = match frames.try_recv() {
            Ok(ViewerFrame::Close { code, reason }) => (code, reason),
            _ => (code, reason),
        };
        close_with(ws, code, reason).await;
        return;
    }

    let (mut sink, mut stream) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let message = match frame {
                ViewerFrame::Text(text) => Message::Text(text),
                ViewerFrame::Close { code, reason } => {
                    let _ = sink.send(close_message(code, reason)).await;
                    return;
                }
            };
            if sink.send(message).await.is_err() {
                return;
            }
        }
        // Channel ended without an explicit close frame.
        let _ = sink.send(close_message(close_code::NORMAL, "Session closed")).await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.registry.disconnect(&session_id, connection_id);
    let _ = writer.await;
}

async fn serve_feed<S: SessionStore>(
    state: Arc<WsState<S>>,
    ws: WsStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = ws.split();
    tracing::debug!(peer = %peer, "Publisher connected");

    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = stream.next() => incoming,
        };
        let bytes = match incoming {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };

        let message = serde_json::from_slice::<FeedFrame>(&bytes)
            .and_then(FeedFrame::into_message);
        match message {
            Ok(message) => {
                state.feed.offer(message);
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Dropping malformed feed frame");
            }
        }
    }

    let _ = sink.close().await;
    tracing::debug!(peer = %peer, "Publisher disconnected");
}

async fn serve_notifications<S: SessionStore>(
    state: Arc<WsState<S>>,
    ws: WsStream,
    cancel: CancellationToken,
) {
    let Some(mut notes) = state.notifier.subscribe() else {
        close_with(ws, close_code::GOING_AWAY, "Shutting down").await;
        return;
    };
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            note = notes.recv() => match note {
                Ok(note) => {
                    let Ok(json) = serde_json::to_string(&note) else {
                        continue;
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notification listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let _ = sink
        .send(close_message(close_code::GOING_AWAY, "Shutting down"))
        .await;
}
