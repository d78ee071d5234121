//! Transport abstraction for the lifecycle client.
//!
//! The [`Transport`] trait describes one *connection handle*: a single
//! instantiation of an underlying bidirectional connection (a WebSocket
//! stream, a framed TCP socket, an in-memory test double). The lifecycle
//! controller creates a fresh handle through a [`TransportFactory`] on every
//! open, so a reopened client never reuses a handle.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use ws_lifecycle_client::{
//!     CloseCode, Frame, Result, Transport, TransportState, WsMessage,
//! };
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn open(&self, url: &str, cancel: &CancellationToken) -> Result<()> {
//!         // Establish the connection; honor `cancel` while connecting.
//!         todo!()
//!     }
//!
//!     async fn send(&self, message: WsMessage, cancel: &CancellationToken) -> Result<()> {
//!         todo!()
//!     }
//!
//!     async fn close(
//!         &self,
//!         code: CloseCode,
//!         reason: &str,
//!         cancel: &CancellationToken,
//!     ) -> Result<()> {
//!         todo!()
//!     }
//!
//!     fn abort(&self) {
//!         // Unconditional, synchronous, idempotent teardown.
//!     }
//!
//!     fn state(&self) -> TransportState {
//!         todo!()
//!     }
//!
//!     async fn receive(&self) -> Result<Option<Frame>> {
//!         // Return Ok(None) when the inbound stream ends without a
//!         // close frame.
//!         todo!()
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::close_code::CloseCode;
use crate::error::Result;
use crate::message::WsMessage;

/// Connection progress as reported by a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// The handle exists but no connection attempt has been made.
    #[default]
    None,
    /// A connection attempt is in progress.
    Connecting,
    /// The connection is established and can carry traffic.
    Open,
    /// A close handshake is in progress.
    Closing,
    /// The connection completed a close handshake.
    Closed,
    /// The connection was torn down without a handshake.
    Aborted,
}

impl TransportState {
    /// Returns `true` if the state is terminal: the handle can never carry
    /// traffic again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted | Self::None)
    }
}

/// Kind tag for a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text payload.
    Text,
    /// Opaque binary payload.
    Binary,
}

/// One inbound unit delivered by [`Transport::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data frame, possibly one fragment of a larger logical message.
    Data {
        /// Payload kind of the logical message this frame belongs to.
        kind: MessageKind,
        /// Fragment payload bytes.
        payload: Vec<u8>,
        /// `true` if this frame completes the logical message.
        fin: bool,
    },
    /// An explicit close frame from the peer.
    Close {
        /// Close status code, [`CloseCode::NoStatus`] if absent.
        code: CloseCode,
        /// Optional human-readable close reason.
        reason: Option<String>,
    },
}

/// One instantiation of an underlying connection.
///
/// All methods take `&self`: a handle is shared between the lifecycle
/// controller and its receive loop, so implementations use interior
/// mutability. Only the receive loop calls [`receive`](Transport::receive),
/// and only the controller calls the remaining methods, so implementations
/// may assume at most one concurrent caller per method.
///
/// # Cancel Safety
///
/// [`receive`](Transport::receive) **MUST** be cancel-safe: the receive loop
/// may be dropped mid-await during teardown and no inbound data may be lost
/// before that point.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the connection.
    ///
    /// Called at most once per handle. Implementations should observe
    /// `cancel` while connecting and return [`WsClientError::Cancelled`]
    /// if it fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    ///
    /// [`WsClientError::Cancelled`]: crate::WsClientError::Cancelled
    async fn open(&self, url: &str, cancel: &CancellationToken) -> Result<()>;

    /// Transmit one complete logical message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be sent.
    async fn send(&self, message: WsMessage, cancel: &CancellationToken) -> Result<()>;

    /// Perform a graceful close handshake with the given status code.
    ///
    /// The caller inspects [`state`](Transport::state) afterwards; a
    /// successful return does not by itself guarantee a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake could not be carried out.
    async fn close(&self, code: CloseCode, reason: &str, cancel: &CancellationToken) -> Result<()>;

    /// Unconditional, synchronous teardown: release resources and wake any
    /// pending receive. Idempotent; never fails.
    fn abort(&self);

    /// Current connection state of this handle.
    fn state(&self) -> TransportState;

    /// Receive the next inbound unit.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` — a data fragment or close frame arrived
    /// - `Ok(None)` — the inbound stream ended without a close frame
    ///   (ambiguous disconnect), or the handle was aborted
    /// - `Err(e)` — the transport failed while receiving
    ///
    /// # Errors
    ///
    /// Returns [`WsClientError::ReceiveFailed`] (or another transport error)
    /// when the connection breaks mid-receive.
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](Transport)).
    ///
    /// [`WsClientError::ReceiveFailed`]: crate::WsClientError::ReceiveFailed
    async fn receive(&self) -> Result<Option<Frame>>;
}

/// Factory producing one fresh [`Transport`] handle per open attempt.
///
/// Implemented for plain closures, so tests and embedders can inject
/// scripted handles:
///
/// ```rust,ignore
/// let client = WsClient::new(config, || Arc::new(MyTransport::new()) as Arc<dyn Transport>);
/// ```
pub trait TransportFactory: Send + Sync + 'static {
    /// Create a new, unconnected transport handle.
    fn create(&self) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Arc<dyn Transport> + Send + Sync + 'static,
{
    fn create(&self) -> Arc<dyn Transport> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TransportState::None.is_terminal());
        assert!(TransportState::Closed.is_terminal());
        assert!(TransportState::Aborted.is_terminal());
        assert!(!TransportState::Connecting.is_terminal());
        assert!(!TransportState::Open.is_terminal());
        assert!(!TransportState::Closing.is_terminal());
    }

    #[test]
    fn transport_trait_is_object_safe() {
        fn assert_dyn(_t: Option<&dyn Transport>) {}
        assert_dyn(None);
    }
}
