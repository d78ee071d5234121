//! # WS Lifecycle Client
//!
//! Transport-agnostic lifecycle controller for persistent WebSocket-style
//! connections.
//!
//! [`WsClient`] arbitrates the full connection lifecycle over any
//! bidirectional transport: single-flight open and close, a supervised
//! background receive loop per connection handle, and ordered event
//! delivery with an exactly-once terminal `Closed` notification.
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement the [`Transport`] trait for any backend
//! - **Race-safe lifecycle** — concurrent opens and closes are arbitrated by
//!   narrow compare-and-set guards, never a global lock
//! - **WebSocket built-in** — default `transport-websocket` feature provides
//!   [`WebSocketTransport`]
//! - **Event-driven** — subscribe to message, closed, and error events;
//!   stale connection handles can never emit
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use ws_lifecycle_client::{CloseCode, WsClient, WsClientConfig};
//!
//! # async fn example() -> ws_lifecycle_client::Result<()> {
//! let client = WsClient::websocket(WsClientConfig::new("ws://localhost:9001/ws"));
//!
//! client.on_message(|msg| println!("received: {msg:?}"));
//! client.on_closed(|code, reason| println!("closed: {code} {reason:?}"));
//!
//! let cancel = CancellationToken::new();
//! client.open(&cancel).await?;
//! client.send_text("hello", &cancel).await?;
//! client.ensure_close(Some(CloseCode::Normal), Some("bye"), &cancel).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod close_code;
pub mod error;
pub mod event;
pub mod message;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{WsClient, WsClientConfig};
pub use close_code::CloseCode;
pub use error::{Result, WsClientError};
pub use event::{EventDispatcher, SubscriptionId};
pub use message::WsMessage;
pub use transport::{Frame, MessageKind, Transport, TransportFactory, TransportState};

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
