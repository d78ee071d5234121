//! Error types for the WebSocket lifecycle client.

use thiserror::Error;

/// Errors that can occur when using the lifecycle client or a transport.
#[derive(Debug, Error)]
pub enum WsClientError {
    /// The operation is not permitted in the current lifecycle state
    /// (reentrant open, or send while not open).
    #[error("operation not permitted in the current connection state")]
    InvalidState,

    /// The transport open attempt failed or left the connection in an
    /// unconfirmed state.
    #[error("open failed: {reason}")]
    OpenFailed {
        /// Human-readable cause of the failure.
        reason: String,
    },

    /// The transport rejected a send.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The transport failed while receiving inbound data.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The transport connection is closed and cannot carry traffic.
    #[error("transport connection closed")]
    TransportClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for lifecycle client operations.
pub type Result<T> = std::result::Result<T, WsClientError>;
