//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketTransport`], a [`Transport`]
//! implementation over a WebSocket connection. Both `ws://` and `wss://`
//! URLs are supported — TLS is handled transparently via
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is
//! enabled (it is enabled by default).
//!
//! One handle represents one connection attempt: the lifecycle controller
//! creates a fresh [`WebSocketTransport`] per open through its factory, so a
//! handle is never reconnected after it reaches a terminal state.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WireCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::close_code::CloseCode;
use crate::error::{Result, WsClientError};
use crate::message::WsMessage;
use crate::transport::{Frame, MessageKind, Transport, TransportState};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// A [`Transport`] handle backed by a `tokio-tungstenite` WebSocket stream.
///
/// The stream is split on open: the controller drives the sink half through
/// [`send`](Transport::send) and [`close`](Transport::close) while the
/// receive loop drains the stream half through [`receive`](Transport::receive).
/// [`abort`](Transport::abort) is synchronous; it cancels a level-triggered
/// token that every receive selects on, so a pending (or not-yet-parked)
/// receive always observes the abort regardless of how the two interleave.
///
/// # Cancel Safety
///
/// [`receive`](Transport::receive) is cancel-safe: it forwards to the
/// cancel-safe `StreamExt::next`, so dropping the future mid-await loses no
/// inbound frames.
pub struct WebSocketTransport {
    state: Mutex<TransportState>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    source: tokio::sync::Mutex<Option<WsSource>>,
    abort_token: CancellationToken,
}

impl WebSocketTransport {
    /// Create a new, unconnected handle.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::None),
            sink: tokio::sync::Mutex::new(None),
            source: tokio::sync::Mutex::new(None),
            abort_token: CancellationToken::new(),
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }

    async fn connect(url: &str) -> Result<WsStream> {
        debug!(url = %url, "connecting to WebSocket server");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                WsError::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            WsClientError::Io(std::io::Error::new(kind, e))
        })?;

        debug!(url = %url, "WebSocket connection established");
        Ok(stream)
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str, cancel: &CancellationToken) -> Result<()> {
        self.set_state(TransportState::Connecting);

        let stream = tokio::select! {
            outcome = Self::connect(url) => outcome?,
            () = cancel.cancelled() => return Err(WsClientError::Cancelled),
        };

        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock().await = Some(source);
        self.set_state(TransportState::Open);
        Ok(())
    }

    async fn send(&self, message: WsMessage, cancel: &CancellationToken) -> Result<()> {
        if self.state() != TransportState::Open {
            return Err(WsClientError::TransportClosed);
        }

        let frame = match message {
            WsMessage::Text(text) => Message::Text(text.into()),
            WsMessage::Binary(bytes) => Message::Binary(bytes.into()),
        };

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(WsClientError::TransportClosed)?;
        tokio::select! {
            outcome = sink.send(frame) => {
                outcome.map_err(|e| WsClientError::SendFailed(e.to_string()))
            }
            () = cancel.cancelled() => Err(WsClientError::Cancelled),
        }
    }

    async fn close(&self, code: CloseCode, reason: &str, cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(WsClientError::TransportClosed)?;

        self.set_state(TransportState::Closing);
        let frame = Message::Close(Some(CloseFrame {
            code: WireCloseCode::from(code.as_u16()),
            reason: reason.to_owned().into(),
        }));

        let outcome = tokio::select! {
            outcome = sink.send(frame) => outcome,
            () = cancel.cancelled() => return Err(WsClientError::Cancelled),
        };
        match outcome {
            // tungstenite reports ConnectionClosed once the handshake has
            // completed from our side; the close frame still went out.
            Ok(()) | Err(WsError::ConnectionClosed) => {
                self.set_state(TransportState::Closed);
                Ok(())
            }
            Err(e) => Err(WsClientError::SendFailed(e.to_string())),
        }
    }

    fn abort(&self) {
        self.set_state(TransportState::Aborted);
        // The token is level-triggered: a receive that has not parked yet
        // still observes the cancellation when it selects.
        self.abort_token.cancel();
        // Drop the halves if nothing holds them; a receive loop parked on
        // the source is woken by the token and returns.
        if let Ok(mut sink) = self.sink.try_lock() {
            sink.take();
        }
        if let Ok(mut source) = self.source.try_lock() {
            source.take();
        }
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    async fn receive(&self) -> Result<Option<Frame>> {
        if self.abort_token.is_cancelled() {
            return Ok(None);
        }

        let mut guard = self.source.lock().await;
        let Some(source) = guard.as_mut() else {
            return Ok(None);
        };

        loop {
            let item = tokio::select! {
                () = self.abort_token.cancelled() => return Ok(None),
                item = source.next() => item,
            };

            match item {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Frame::Data {
                        kind: MessageKind::Text,
                        payload: text.as_bytes().to_vec(),
                        fin: true,
                    }));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(Frame::Data {
                        kind: MessageKind::Binary,
                        payload: bytes.to_vec(),
                        fin: true,
                    }));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "received WebSocket close frame");
                    self.set_state(TransportState::Closed);
                    let (code, reason) = match frame {
                        Some(f) => {
                            let reason =
                                (!f.reason.is_empty()).then(|| f.reason.as_str().to_owned());
                            (CloseCode::from(u16::from(f.code)), reason)
                        }
                        None => (CloseCode::NoStatus, None),
                    };
                    return Ok(Some(Frame::Close { code, reason }));
                }
                Some(Ok(Message::Ping(_))) => {
                    debug!("received WebSocket ping (auto-pong handled by tungstenite)");
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("received WebSocket pong (ignored)");
                }
                Some(Ok(Message::Frame(_))) => {
                    // Never produced by the read half; the arm exists only to
                    // satisfy exhaustiveness checks.
                    debug!("received raw WebSocket frame, skipping");
                }
                // A drop without a close handshake is an ambiguous
                // disconnect, not a receive failure.
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))
                | Some(Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)))
                | None => {
                    self.set_state(TransportState::Closed);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(WsClientError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::net::TcpListener;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn websocket_transport_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn open_fails_with_invalid_url() {
        let transport = WebSocketTransport::new();
        let err = transport.open("not-a-valid-url", &token()).await.unwrap_err();
        assert!(matches!(err, WsClientError::Io(_)));
        assert_ne!(transport.state(), TransportState::Open);
    }

    #[tokio::test]
    async fn open_fails_with_unreachable_host() {
        let transport = WebSocketTransport::new();
        let err = transport.open("ws://127.0.0.1:1", &token()).await.unwrap_err();
        assert!(matches!(err, WsClientError::Io(_)));
    }

    #[tokio::test]
    async fn open_honors_cancellation() {
        let transport = WebSocketTransport::new();
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        // Non-routable address, so only the cancellation can complete first.
        let err = transport
            .open("ws://192.0.2.1:1", &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, WsClientError::Cancelled));
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    async fn open_transport(url: &str) -> WebSocketTransport {
        let transport = WebSocketTransport::new();
        transport.open(url, &token()).await.unwrap();
        assert_eq!(transport.state(), TransportState::Open);
        transport
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn receive_yields_text_frames_in_order() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.send(Message::Text("world".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let transport = open_transport(&url).await;

        let first = transport.receive().await.unwrap().unwrap();
        assert_eq!(
            first,
            Frame::Data {
                kind: MessageKind::Text,
                payload: b"hello".to_vec(),
                fin: true,
            }
        );

        let second = transport.receive().await.unwrap().unwrap();
        assert_eq!(
            second,
            Frame::Data {
                kind: MessageKind::Text,
                payload: b"world".to_vec(),
                fin: true,
            }
        );
    }

    #[tokio::test]
    async fn receive_yields_binary_frames() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let transport = open_transport(&url).await;
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                kind: MessageKind::Binary,
                payload: vec![0xDE, 0xAD],
                fin: true,
            }
        );
    }

    #[tokio::test]
    async fn receive_surfaces_the_close_frame() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: WireCloseCode::Away,
                reason: "maintenance".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let transport = open_transport(&url).await;
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Close {
                code: CloseCode::Away,
                reason: Some("maintenance".into()),
            }
        );
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn abrupt_server_drop_is_an_ambiguous_disconnect() {
        let url = start_mock_server(|ws| async move {
            // Drop the stream without a close handshake.
            drop(ws);
        })
        .await;

        let transport = open_transport(&url).await;
        let outcome = transport.receive().await.unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn send_round_trip() {
        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let transport = open_transport(&url).await;
        transport
            .send(WsMessage::Text("ping_echo".into()), &token())
            .await
            .unwrap();

        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                kind: MessageKind::Text,
                payload: b"ping_echo".to_vec(),
                fin: true,
            }
        );
    }

    #[tokio::test]
    async fn close_sends_code_and_reason() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Close(frame) = message {
                    let _ = seen_tx.send(frame);
                    break;
                }
            }
        })
        .await;

        let transport = open_transport(&url).await;
        transport
            .close(CloseCode::Normal, "done here", &token())
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Closed);

        let frame = seen_rx.await.unwrap().unwrap();
        assert_eq!(u16::from(frame.code), 1000);
        assert_eq!(frame.reason.as_str(), "done here");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let transport = open_transport(&url).await;
        transport
            .close(CloseCode::Normal, "", &token())
            .await
            .unwrap();

        let err = transport
            .send(WsMessage::Text("oops".into()), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, WsClientError::TransportClosed));
    }

    #[tokio::test]
    async fn abort_wakes_a_pending_receive() {
        let url = start_mock_server(|mut ws| async move {
            // Hold the connection open without sending anything.
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let transport = Arc::new(open_transport(&url).await);
        let receiving = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.receive().await }
        });
        // Give the receive a chance to park on the stream.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        transport.abort();
        assert_eq!(transport.state(), TransportState::Aborted);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), receiving)
            .await
            .expect("receive did not wake after abort")
            .unwrap();
        assert_eq!(outcome.unwrap(), None);
    }

    #[tokio::test]
    async fn abort_issued_before_receive_parks_is_not_lost() {
        let url = start_mock_server(|mut ws| async move {
            // Quiet connection: never send, so only the abort can end it.
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let transport = Arc::new(open_transport(&url).await);
        let receiving = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.receive().await }
        });
        // Abort immediately, before the receive future has been polled.
        // The abort signal must be level-triggered so the receive still
        // observes it when it gets to run.
        transport.abort();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), receiving)
            .await
            .expect("receive parked through an abort")
            .unwrap();
        assert_eq!(outcome.unwrap(), None);
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let transport = WebSocketTransport::new();
        transport.abort();
        transport.abort();
        assert_eq!(transport.state(), TransportState::Aborted);
    }

    #[tokio::test]
    async fn receive_on_unopened_handle_returns_none() {
        let transport = WebSocketTransport::new();
        assert_eq!(transport.receive().await.unwrap(), None);
    }
}
