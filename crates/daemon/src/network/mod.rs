//! Network transports.
//!
//! The daemon exposes a single WebSocket listener carrying live viewers,
//! result publishers and notification listeners.

pub mod websocket;

pub use websocket::{FeedFrame, Route, WebSocketServer, WsState};
