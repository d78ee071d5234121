//! Built-in [`Transport`](crate::Transport) implementations.
//!
//! Concrete transports live behind feature gates. Enable the corresponding
//! Cargo feature to pull one in:
//!
//! | Feature                | Transport              |
//! |------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`] |
//!
//! # Example
//!
//! ```rust,ignore
//! use ws_lifecycle_client::{WsClient, WsClientConfig};
//!
//! // `WsClient::websocket` wires the built-in transport up for you.
//! let client = WsClient::websocket(WsClientConfig::new("ws://localhost:9001/ws"));
//! ```

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketTransport;
