//! Lifecycle controller for a persistent bidirectional connection.
//!
//! [`WsClient`] owns the connection lifecycle: it arbitrates concurrent
//! open/close/send requests, creates one transport handle per open through a
//! [`TransportFactory`], and supervises a background receive loop per live
//! handle. Single-flight guarantees come from two narrow compare-and-set
//! guards rather than a global lock, so reentrant calls are rejected without
//! blocking.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = WsClientConfig::new("ws://localhost:9001/ws");
//! let client = WsClient::websocket(config);
//!
//! client.on_message(|msg| println!("received: {msg:?}"));
//! client.on_closed(|code, reason| println!("closed: {code} {reason:?}"));
//!
//! let cancel = CancellationToken::new();
//! client.open(&cancel).await?;
//! client.send_text("ping", &cancel).await?;
//! client.ensure_close(Some(CloseCode::Normal), Some("bye"), &cancel).await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::close_code::CloseCode;
use crate::error::{Result, WsClientError};
use crate::event::{EventDispatcher, SubscriptionId};
use crate::message::WsMessage;
use crate::transport::{Frame, MessageKind, Transport, TransportFactory, TransportState};

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`WsClient`].
///
/// The only required field is `url`; the close defaults are used when
/// [`WsClient::ensure_close`] is called without an explicit code or reason.
///
/// # Example
///
/// ```
/// use ws_lifecycle_client::{CloseCode, WsClientConfig};
///
/// let config = WsClientConfig::new("ws://localhost:9001/ws")
///     .with_default_close_code(CloseCode::Away)
///     .with_default_close_reason("session over");
/// assert_eq!(config.url, "ws://localhost:9001/ws");
/// ```
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Endpoint the transport connects to on every open.
    pub url: String,
    /// Close code used when `ensure_close` is called without one.
    /// Defaults to [`CloseCode::Normal`].
    pub default_close_code: CloseCode,
    /// Close reason used when `ensure_close` is called without one.
    /// Defaults to the empty string (no reason reported).
    pub default_close_reason: String,
}

impl WsClientConfig {
    /// Create a new configuration with the given endpoint URL and defaults.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            default_close_code: CloseCode::Normal,
            default_close_reason: String::new(),
        }
    }

    /// Set the close code used when `ensure_close` gets no explicit code.
    #[must_use]
    pub fn with_default_close_code(mut self, code: CloseCode) -> Self {
        self.default_close_code = code;
        self
    }

    /// Set the close reason used when `ensure_close` gets no explicit reason.
    #[must_use]
    pub fn with_default_close_reason(mut self, reason: impl Into<String>) -> Self {
        self.default_close_reason = reason.into();
        self
    }
}

// ── Connection handle ───────────────────────────────────────────────

/// One connection handle: a transport instance plus its dismissal flag.
///
/// The flag is the single arbiter of the handle's terminal notification:
/// whichever teardown path wins the compare-and-set in [`Conn::dismiss`]
/// owns the (at most one) `Closed` emission for this handle, and every
/// loser stays silent.
struct Conn {
    transport: Arc<dyn Transport>,
    terminated: AtomicBool,
}

impl Conn {
    fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            terminated: AtomicBool::new(false),
        })
    }

    /// Claim this handle's terminal transition. Returns `true` for exactly
    /// one caller over the handle's lifetime.
    fn dismiss(&self) -> bool {
        self.terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_dismissed(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// State shared between the client handle and its receive loops.
struct Shared {
    /// The current connection handle. Mutated only by the controller;
    /// receive loops read it to detect staleness.
    current: Mutex<Option<Arc<Conn>>>,
    /// Open guard: set while an open attempt is in flight.
    opening: AtomicBool,
    /// Close guard: set while an explicit graceful close is in flight.
    closing: AtomicBool,
    dispatcher: EventDispatcher,
}

impl Shared {
    fn current(&self) -> Option<Arc<Conn>> {
        self.current.lock().clone()
    }

    /// Identity comparison against the current handle. Handles are compared
    /// by pointer, never by value.
    fn is_current(&self, conn: &Arc<Conn>) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, conn))
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Transport-agnostic client for a persistent bidirectional connection.
///
/// Construct with [`WsClient::new`] and any [`TransportFactory`], or with
/// [`WsClient::websocket`] for the built-in `tokio-tungstenite` binding.
///
/// All operations take `&self`; the client is safe to share behind an
/// `Arc` across tasks. Guarantees:
///
/// - at most one open attempt and at most one graceful close run at a time
///   (losers of the open race fail fast with
///   [`InvalidState`](WsClientError::InvalidState); extra close requests
///   degrade to an abort)
/// - exactly one `Closed` notification per connection handle
/// - message events preserve arrival order per handle
pub struct WsClient {
    shared: Arc<Shared>,
    factory: Box<dyn TransportFactory>,
    config: WsClientConfig,
}

impl WsClient {
    /// Create a client that builds one transport handle per open attempt
    /// through `factory`.
    pub fn new(config: WsClientConfig, factory: impl TransportFactory) -> Self {
        Self {
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                opening: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                dispatcher: EventDispatcher::new(),
            }),
            factory: Box::new(factory),
            config,
        }
    }

    /// Create a client backed by the built-in WebSocket transport.
    #[cfg(feature = "transport-websocket")]
    pub fn websocket(config: WsClientConfig) -> Self {
        use crate::transports::websocket::WebSocketTransport;
        Self::new(config, || {
            Arc::new(WebSocketTransport::new()) as Arc<dyn Transport>
        })
    }

    // ── Lifecycle operations ────────────────────────────────────────

    /// Open the connection.
    ///
    /// Creates a fresh transport handle, connects it, and starts a receive
    /// loop bound to it. Exactly one caller wins under concurrent
    /// invocation; losers fail with [`InvalidState`](WsClientError::InvalidState)
    /// without touching the transport. The open guard is cleared on every
    /// exit path, so a failed open never blocks a retry.
    ///
    /// # Errors
    ///
    /// - [`InvalidState`](WsClientError::InvalidState) — an open is already
    ///   in flight, or the connection is already open
    /// - [`Cancelled`](WsClientError::Cancelled) — `cancel` fired; the
    ///   in-flight handle was aborted
    /// - [`OpenFailed`](WsClientError::OpenFailed) — the transport failed to
    ///   connect, or connected without reaching the open state
    pub async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        if self
            .shared
            .opening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WsClientError::InvalidState);
        }

        let outcome = self.open_guarded(cancel).await;
        self.shared.opening.store(false, Ordering::Release);
        outcome
    }

    /// Open path executed while holding the open guard.
    async fn open_guarded(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_open() {
            return Err(WsClientError::InvalidState);
        }

        let conn = Conn::new(self.factory.create());
        // The new handle supersedes whatever came before; a receive loop
        // still bound to the old handle notices on its next staleness check
        // and aborts it.
        *self.shared.current.lock() = Some(Arc::clone(&conn));

        debug!(url = %self.config.url, "opening connection");
        let opened = tokio::select! {
            result = conn.transport.open(&self.config.url, cancel) => result,
            () = cancel.cancelled() => Err(WsClientError::Cancelled),
        };

        match opened {
            Ok(()) => {
                if conn.transport.state() != TransportState::Open {
                    conn.transport.abort();
                    return Err(WsClientError::OpenFailed {
                        reason: "transport did not reach the open state".into(),
                    });
                }
                tokio::spawn(receive_loop(Arc::clone(&self.shared), conn));
                debug!("connection open");
                Ok(())
            }
            Err(WsClientError::Cancelled) => {
                debug!("open cancelled, aborting in-flight handle");
                conn.transport.abort();
                Err(WsClientError::Cancelled)
            }
            Err(e) => {
                conn.transport.abort();
                Err(WsClientError::OpenFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Send one complete logical message.
    ///
    /// # Errors
    ///
    /// - [`InvalidState`](WsClientError::InvalidState) — the connection is
    ///   not open
    /// - [`SendFailed`](WsClientError::SendFailed) — the transport rejected
    ///   the send (including transport-dependent cancellation). No retry is
    ///   attempted.
    pub async fn send(&self, message: WsMessage, cancel: &CancellationToken) -> Result<()> {
        let conn = self
            .shared
            .current()
            .filter(|c| !c.is_dismissed() && c.transport.state() == TransportState::Open)
            .ok_or(WsClientError::InvalidState)?;

        conn.transport
            .send(message, cancel)
            .await
            .map_err(|e| match e {
                WsClientError::SendFailed(_) => e,
                other => WsClientError::SendFailed(other.to_string()),
            })
    }

    /// Send a UTF-8 text message.
    ///
    /// # Errors
    ///
    /// See [`send`](WsClient::send).
    pub async fn send_text(
        &self,
        text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.send(WsMessage::Text(text.into()), cancel).await
    }

    /// Send a binary message.
    ///
    /// # Errors
    ///
    /// See [`send`](WsClient::send).
    pub async fn send_binary(&self, bytes: Vec<u8>, cancel: &CancellationToken) -> Result<()> {
        self.send(WsMessage::Binary(bytes), cancel).await
    }

    /// Close the connection, best-effort. Never fails.
    ///
    /// If an open is in flight, a close is already in flight, or the
    /// connection is not open, the current handle is aborted unconditionally
    /// and the call returns. Otherwise a graceful close handshake runs with
    /// the given (or configured default) code and reason; any handshake
    /// failure, cancellation, or non-terminal outcome degrades to an abort.
    ///
    /// The graceful path claims the handle's terminal notification up front,
    /// so the receive loop stays silent and the single `Closed` event is
    /// emitted here, after teardown completes.
    pub async fn ensure_close(
        &self,
        code: Option<CloseCode>,
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) {
        if self.shared.opening.load(Ordering::Acquire) || !self.is_open() {
            self.abort_current();
            return;
        }
        if self
            .shared
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A close is already in flight; degrade to an abort.
            self.abort_current();
            return;
        }

        let Some(conn) = self.shared.current() else {
            self.shared.closing.store(false, Ordering::Release);
            return;
        };

        let code = code.unwrap_or(self.config.default_close_code);
        let reason = reason.unwrap_or(&self.config.default_close_reason);

        // Claim the terminal notification before touching the transport so
        // a racing receive cannot double-report this handle.
        let claimed = conn.dismiss();

        debug!(code = %code, reason, "closing connection");
        let handshake = tokio::select! {
            result = conn.transport.close(code, reason, cancel) => Some(result),
            () = cancel.cancelled() => None,
        };

        match handshake {
            Some(Ok(())) => {
                if !conn.transport.state().is_terminal() {
                    warn!(state = ?conn.transport.state(), "close left transport non-terminal, aborting");
                    conn.transport.abort();
                }
            }
            Some(Err(e)) => {
                warn!("close handshake failed: {e}, aborting");
                conn.transport.abort();
            }
            None => {
                debug!("close cancelled, aborting");
                conn.transport.abort();
            }
        }

        if claimed {
            let reported = if reason.is_empty() { None } else { Some(reason) };
            self.shared.dispatcher.emit_closed(code, reported);
        }
        self.shared.closing.store(false, Ordering::Release);
    }

    /// Returns `true` if the current handle reports an open connection.
    pub fn is_open(&self) -> bool {
        self.shared
            .current()
            .is_some_and(|c| !c.is_dismissed() && c.transport.state() == TransportState::Open)
    }

    /// Abort the current handle and release every event subscription.
    ///
    /// The aborted handle's receive loop exits without emitting; no further
    /// events are delivered after this call returns.
    pub fn dispose(&self) {
        debug!("dispose requested");
        if let Some(conn) = self.shared.current.lock().take() {
            conn.dismiss();
            conn.transport.abort();
        }
        self.shared.dispatcher.clear();
    }

    // ── Event subscriptions ─────────────────────────────────────────

    /// Subscribe to complete inbound messages. Handlers run synchronously on
    /// the receive loop task, in registration order.
    pub fn on_message(
        &self,
        handler: impl Fn(&WsMessage) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.dispatcher.subscribe_message(handler)
    }

    /// Subscribe to the terminal close notification. Fired exactly once per
    /// connection handle.
    pub fn on_closed(
        &self,
        handler: impl Fn(CloseCode, Option<&str>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.dispatcher.subscribe_closed(handler)
    }

    /// Subscribe to asynchronous transport errors raised by the receive
    /// loop. Synchronous failures of `open`/`send` are returned to their
    /// caller instead and never appear here.
    pub fn on_error(
        &self,
        handler: impl Fn(&WsClientError) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.dispatcher.subscribe_error(handler)
    }

    /// Remove a subscription. Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unsubscribe(id)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn abort_current(&self) {
        if let Some(conn) = self.shared.current() {
            debug!("aborting current handle");
            conn.transport.abort();
        }
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.config.url)
            .field("open", &self.is_open())
            .field("opening", &self.shared.opening.load(Ordering::Acquire))
            .field("closing", &self.shared.closing.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ── Receive loop ────────────────────────────────────────────────────

/// Outcome of a staleness check, taken immediately before any emission.
enum HandleStatus {
    /// This loop's handle is still the current, undismissed handle.
    Live,
    /// An explicit close or abort already claimed this handle.
    Dismissed,
    /// A newer handle replaced this one; the stale handle must be aborted.
    Superseded,
}

fn handle_status(shared: &Shared, conn: &Arc<Conn>) -> HandleStatus {
    if conn.is_dismissed() {
        HandleStatus::Dismissed
    } else if !shared.is_current(conn) {
        HandleStatus::Superseded
    } else {
        HandleStatus::Live
    }
}

/// Background receive loop bound to exactly one connection handle.
///
/// Drains inbound frames until the handle closes, fails, or is superseded.
/// Partial frames are accumulated into one buffer per logical message.
/// Staleness is re-checked immediately before every emission: a close or
/// reopen racing with an in-flight receive always wins the notification, so
/// the application never observes events for a handle it already tore down
/// or replaced.
async fn receive_loop(shared: Arc<Shared>, conn: Arc<Conn>) {
    debug!("receive loop started");
    let mut buffer: Vec<u8> = Vec::new();
    let mut kind = MessageKind::Text;

    while conn.transport.state() == TransportState::Open {
        match conn.transport.receive().await {
            Ok(Some(Frame::Data {
                kind: frame_kind,
                payload,
                fin,
            })) => {
                if buffer.is_empty() {
                    kind = frame_kind;
                }
                buffer.extend_from_slice(&payload);
                if !fin {
                    continue;
                }
                let complete = std::mem::take(&mut buffer);

                match handle_status(&shared, &conn) {
                    HandleStatus::Live => {}
                    HandleStatus::Dismissed => {
                        debug!("handle dismissed, dropping inbound message");
                        return;
                    }
                    HandleStatus::Superseded => {
                        debug!("handle superseded, aborting stale handle");
                        conn.transport.abort();
                        return;
                    }
                }

                let message = match kind {
                    MessageKind::Text => {
                        WsMessage::Text(String::from_utf8_lossy(&complete).into_owned())
                    }
                    MessageKind::Binary => WsMessage::Binary(complete),
                };
                shared.dispatcher.emit_message(&message);
            }
            Ok(Some(Frame::Close { code, reason })) => {
                debug!(code = %code, ?reason, "received close frame");
                match handle_status(&shared, &conn) {
                    HandleStatus::Live => {}
                    HandleStatus::Dismissed => return,
                    HandleStatus::Superseded => {
                        conn.transport.abort();
                        return;
                    }
                }
                if conn.dismiss() {
                    shared.dispatcher.emit_closed(code, reason.as_deref());
                }
                return;
            }
            // Inbound stream ended without a close frame.
            Ok(None) => break,
            Err(e) => {
                error!("receive failed: {e}");
                match handle_status(&shared, &conn) {
                    HandleStatus::Live => {}
                    HandleStatus::Dismissed => return,
                    HandleStatus::Superseded => {
                        conn.transport.abort();
                        return;
                    }
                }
                conn.transport.abort();
                if conn.dismiss() {
                    let detail = e.to_string();
                    shared.dispatcher.emit_error(&e);
                    shared.dispatcher.emit_closed(CloseCode::Away, Some(&detail));
                }
                return;
            }
        }
    }

    // The transport left the open state without an explanatory close frame:
    // an ambiguous disconnect, reported as NoStatus.
    debug!(state = ?conn.transport.state(), "transport left the open state without a close frame");
    match handle_status(&shared, &conn) {
        HandleStatus::Live => {}
        HandleStatus::Dismissed => return,
        HandleStatus::Superseded => {
            conn.transport.abort();
            return;
        }
    }
    if conn.dismiss() {
        shared.dispatcher.emit_closed(CloseCode::NoStatus, None);
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Notify};

    // ── Scripted transport ──────────────────────────────────────────

    #[derive(Clone, Copy)]
    enum OpenBehavior {
        /// Connect successfully and report the open state.
        Succeed,
        /// Fail the connection attempt.
        Refuse,
        /// Return success but never reach the open state.
        StayClosed,
        /// Never complete (for cancellation and single-flight tests).
        Hang,
    }

    #[derive(Clone, Copy)]
    enum CloseBehavior {
        /// Complete the handshake and reach the closed state.
        Succeed,
        /// Return success but stay in the open state.
        NonTerminal,
        /// Fail the handshake.
        Fail,
        /// Never complete (for cancellation and reentrancy tests).
        Hang,
    }

    enum Script {
        Frame(Frame),
        Error(String),
        End,
    }

    /// A scripted transport handle driven from the test body.
    struct ScriptedTransport {
        state: Mutex<TransportState>,
        frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<Script>>,
        abort_notify: Notify,
        aborts: AtomicUsize,
        opens: AtomicUsize,
        sent: Mutex<Vec<WsMessage>>,
        fail_sends: AtomicBool,
        open_behavior: OpenBehavior,
        close_behavior: CloseBehavior,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, _url: &str, _cancel: &CancellationToken) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.open_behavior {
                OpenBehavior::Succeed => {
                    *self.state.lock() = TransportState::Open;
                    Ok(())
                }
                OpenBehavior::Refuse => Err(WsClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))),
                OpenBehavior::StayClosed => Ok(()),
                OpenBehavior::Hang => std::future::pending().await,
            }
        }

        async fn send(&self, message: WsMessage, _cancel: &CancellationToken) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(WsClientError::SendFailed("scripted send failure".into()));
            }
            self.sent.lock().push(message);
            Ok(())
        }

        async fn close(
            &self,
            _code: CloseCode,
            _reason: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            match self.close_behavior {
                CloseBehavior::Succeed => {
                    *self.state.lock() = TransportState::Closed;
                    Ok(())
                }
                CloseBehavior::NonTerminal => Ok(()),
                CloseBehavior::Fail => Err(WsClientError::TransportClosed),
                CloseBehavior::Hang => std::future::pending().await,
            }
        }

        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = TransportState::Aborted;
            self.abort_notify.notify_waiters();
        }

        fn state(&self) -> TransportState {
            *self.state.lock()
        }

        async fn receive(&self) -> Result<Option<Frame>> {
            if self.state() == TransportState::Aborted {
                return Ok(None);
            }
            let mut rx = self.frames.lock().await;
            tokio::select! {
                () = self.abort_notify.notified() => Ok(None),
                item = rx.recv() => match item {
                    Some(Script::Frame(frame)) => Ok(Some(frame)),
                    Some(Script::Error(message)) => Err(WsClientError::ReceiveFailed(message)),
                    Some(Script::End) | None => Ok(None),
                },
            }
        }
    }

    /// Test-side controls for one scripted handle.
    struct Scripted {
        transport: Arc<ScriptedTransport>,
        feed: mpsc::UnboundedSender<Script>,
    }

    impl Scripted {
        fn new(open: OpenBehavior, close: CloseBehavior) -> Self {
            let (feed, rx) = mpsc::unbounded_channel();
            Self {
                transport: Arc::new(ScriptedTransport {
                    state: Mutex::new(TransportState::None),
                    frames: tokio::sync::Mutex::new(rx),
                    abort_notify: Notify::new(),
                    aborts: AtomicUsize::new(0),
                    opens: AtomicUsize::new(0),
                    sent: Mutex::new(Vec::new()),
                    fail_sends: AtomicBool::new(false),
                    open_behavior: open,
                    close_behavior: close,
                }),
                feed,
            }
        }

        fn feed_text(&self, text: &str) {
            self.feed_frame(Frame::Data {
                kind: MessageKind::Text,
                payload: text.as_bytes().to_vec(),
                fin: true,
            });
        }

        fn feed_frame(&self, frame: Frame) {
            self.feed.send(Script::Frame(frame)).unwrap();
        }

        fn feed_error(&self, message: &str) {
            self.feed.send(Script::Error(message.into())).unwrap();
        }

        fn feed_end(&self) {
            self.feed.send(Script::End).unwrap();
        }

        fn set_state(&self, state: TransportState) {
            *self.transport.state.lock() = state;
        }

        fn aborts(&self) -> usize {
            self.transport.aborts.load(Ordering::SeqCst)
        }

        fn opens(&self) -> usize {
            self.transport.opens.load(Ordering::SeqCst)
        }

        fn sent(&self) -> Vec<WsMessage> {
            self.transport.sent.lock().clone()
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn client_with(handles: Vec<Arc<ScriptedTransport>>) -> WsClient {
        client_with_config(WsClientConfig::new("scripted://test"), handles)
    }

    fn client_with_config(config: WsClientConfig, handles: Vec<Arc<ScriptedTransport>>) -> WsClient {
        let queue = Mutex::new(VecDeque::from(handles));
        WsClient::new(config, move || {
            let transport: Arc<dyn Transport> =
                queue.lock().pop_front().expect("scripted factory exhausted");
            transport
        })
    }

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Message(WsMessage),
        Closed(CloseCode, Option<String>),
        Error(String),
    }

    fn watch_events(client: &WsClient) -> mpsc::UnboundedReceiver<TestEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let tx = tx.clone();
            client.on_message(move |message| {
                let _ = tx.send(TestEvent::Message(message.clone()));
            });
        }
        {
            let tx = tx.clone();
            client.on_closed(move |code, reason| {
                let _ = tx.send(TestEvent::Closed(code, reason.map(str::to_owned)));
            });
        }
        client.on_error(move |error| {
            let _ = tx.send(TestEvent::Error(error.to_string()));
        });
        rx
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn expect_no_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) {
        let outcome = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(outcome.is_err(), "unexpected event: {:?}", outcome.unwrap());
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    // ── Open ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn open_reports_open() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        assert!(!client.is_open());
        client.open(&token()).await.unwrap();
        assert!(client.is_open());
        assert_eq!(scripted.opens(), 1);
    }

    #[tokio::test]
    async fn open_while_open_fails_without_touching_transport() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        client.open(&token()).await.unwrap();
        let err = client.open(&token()).await.unwrap_err();
        assert!(matches!(err, WsClientError::InvalidState));

        // The first connection is unaffected and no second handle was built.
        assert!(client.is_open());
        assert_eq!(scripted.opens(), 1);
    }

    #[tokio::test]
    async fn concurrent_open_is_single_flight() {
        let scripted = Scripted::new(OpenBehavior::Hang, CloseBehavior::Succeed);
        let client = Arc::new(client_with(vec![Arc::clone(&scripted.transport)]));

        let first_token = CancellationToken::new();
        let first = tokio::spawn({
            let client = Arc::clone(&client);
            let first_token = first_token.clone();
            async move { client.open(&first_token).await }
        });
        tokio::task::yield_now().await;

        // The second caller loses the guard race and fails fast.
        let err = client.open(&token()).await.unwrap_err();
        assert!(matches!(err, WsClientError::InvalidState));
        assert_eq!(scripted.opens(), 1);

        first_token.cancel();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, Err(WsClientError::Cancelled)));
        assert_eq!(scripted.aborts(), 1);
    }

    #[tokio::test]
    async fn open_failure_clears_guard_for_retry() {
        let refused = Scripted::new(OpenBehavior::Refuse, CloseBehavior::Succeed);
        let accepted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![
            Arc::clone(&refused.transport),
            Arc::clone(&accepted.transport),
        ]);

        let err = client.open(&token()).await.unwrap_err();
        assert!(matches!(err, WsClientError::OpenFailed { .. }));
        assert!(!client.is_open());
        assert_eq!(refused.aborts(), 1);

        // The open guard is clear again: a retry is accepted, not rejected.
        client.open(&token()).await.unwrap();
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn open_without_reaching_open_state_fails() {
        let scripted = Scripted::new(OpenBehavior::StayClosed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        let err = client.open(&token()).await.unwrap_err();
        assert!(matches!(err, WsClientError::OpenFailed { .. }));
        assert_eq!(scripted.aborts(), 1);
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn open_cancellation_aborts_in_flight_handle() {
        let hanging = Scripted::new(OpenBehavior::Hang, CloseBehavior::Succeed);
        let retry = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![
            Arc::clone(&hanging.transport),
            Arc::clone(&retry.transport),
        ]);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = client.open(&cancelled).await.unwrap_err();
        assert!(matches!(err, WsClientError::Cancelled));
        assert_eq!(hanging.aborts(), 1);

        // Guard is clear after cancellation too.
        client.open(&token()).await.unwrap();
        assert!(client.is_open());
    }

    // ── Send ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn send_requires_open_connection() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        let err = client.send_text("early", &token()).await.unwrap_err();
        assert!(matches!(err, WsClientError::InvalidState));
        assert!(scripted.sent().is_empty());
    }

    #[tokio::test]
    async fn send_records_text_and_binary_payloads() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        client.open(&token()).await.unwrap();
        client.send_text("ping", &token()).await.unwrap();
        client.send_binary(vec![0xDE, 0xAD], &token()).await.unwrap();

        assert_eq!(
            scripted.sent(),
            vec![
                WsMessage::Text("ping".into()),
                WsMessage::Binary(vec![0xDE, 0xAD]),
            ]
        );
    }

    #[tokio::test]
    async fn send_failure_is_reported_as_send_failed() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        client.open(&token()).await.unwrap();
        scripted.transport.fail_sends.store(true, Ordering::SeqCst);

        let err = client.send_text("doomed", &token()).await.unwrap_err();
        assert!(matches!(err, WsClientError::SendFailed(_)));
    }

    // ── EnsureClose ─────────────────────────────────────────────────

    #[tokio::test]
    async fn ensure_close_emits_closed_exactly_once() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        client
            .ensure_close(Some(CloseCode::Normal), Some("bye"), &token())
            .await;

        assert!(!client.is_open());
        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::Normal, Some("bye".into()))
        );
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn ensure_close_uses_configured_defaults() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let config = WsClientConfig::new("scripted://test")
            .with_default_close_code(CloseCode::Away)
            .with_default_close_reason("session over");
        let client = client_with_config(config, vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        client.ensure_close(None, None, &token()).await;

        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::Away, Some("session over".into()))
        );
    }

    #[tokio::test]
    async fn ensure_close_handshake_failure_degrades_to_abort() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Fail);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        // Never raises, despite the failing handshake.
        client.ensure_close(None, None, &token()).await;

        assert!(scripted.aborts() >= 1);
        assert!(!client.is_open());
        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::Normal, None)
        );
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn ensure_close_non_terminal_outcome_degrades_to_abort() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::NonTerminal);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        client.open(&token()).await.unwrap();
        client.ensure_close(None, None, &token()).await;

        assert!(scripted.aborts() >= 1);
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn ensure_close_when_not_open_is_a_silent_abort() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        // Nothing is open; the call must not raise and must not notify.
        client.ensure_close(Some(CloseCode::Normal), None, &token()).await;
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn ensure_close_cancellation_degrades_to_abort() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Hang);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        client.ensure_close(None, None, &cancelled).await;

        assert!(scripted.aborts() >= 1);
        assert!(!client.is_open());
        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::Normal, None)
        );
    }

    #[tokio::test]
    async fn reentrant_ensure_close_degrades_to_abort() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Hang);
        let client = Arc::new(client_with(vec![Arc::clone(&scripted.transport)]));
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();

        let first_token = CancellationToken::new();
        let first = tokio::spawn({
            let client = Arc::clone(&client);
            let first_token = first_token.clone();
            async move {
                client
                    .ensure_close(Some(CloseCode::Normal), Some("graceful"), &first_token)
                    .await;
            }
        });
        tokio::task::yield_now().await;

        // Second close finds the guard held and aborts instead.
        client.ensure_close(None, None, &token()).await;
        assert!(scripted.aborts() >= 1);

        first_token.cancel();
        first.await.unwrap();

        // Only the guarded close notifies, and only once.
        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::Normal, Some("graceful".into()))
        );
        expect_no_event(&mut events).await;
    }

    // ── Receive loop ────────────────────────────────────────────────

    #[tokio::test]
    async fn server_close_frame_emits_closed_once() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        scripted.feed_frame(Frame::Close {
            code: CloseCode::Normal,
            reason: Some("server done".into()),
        });

        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::Normal, Some("server done".into()))
        );
        assert!(!client.is_open());
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn ambiguous_disconnect_emits_no_status() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        // The inbound stream ends without a close frame.
        scripted.feed_end();

        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::NoStatus, None)
        );
        assert!(!client.is_open());
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn receive_error_emits_error_then_away() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        scripted.feed_error("wire snapped");

        let first = next_event(&mut events).await;
        assert!(
            matches!(&first, TestEvent::Error(message) if message.contains("wire snapped")),
            "expected Error event, got {first:?}"
        );
        let second = next_event(&mut events).await;
        assert!(
            matches!(&second, TestEvent::Closed(CloseCode::Away, Some(reason)) if reason.contains("wire snapped")),
            "expected Closed(Away) event, got {second:?}"
        );
        assert!(scripted.aborts() >= 1);
        assert!(!client.is_open());
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn messages_preserve_arrival_order() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        scripted.feed_text("A");
        scripted.feed_text("B");

        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Message(WsMessage::Text("A".into()))
        );
        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Message(WsMessage::Text("B".into()))
        );
    }

    #[tokio::test]
    async fn partial_frames_accumulate_into_one_message() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        for (chunk, fin) in [("hel", false), ("lo ", false), ("world", true)] {
            scripted.feed_frame(Frame::Data {
                kind: MessageKind::Text,
                payload: chunk.as_bytes().to_vec(),
                fin,
            });
        }

        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Message(WsMessage::Text("hello world".into()))
        );
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn binary_fragments_keep_their_kind() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        scripted.feed_frame(Frame::Data {
            kind: MessageKind::Binary,
            payload: vec![1, 2],
            fin: false,
        });
        scripted.feed_frame(Frame::Data {
            kind: MessageKind::Binary,
            payload: vec![3],
            fin: true,
        });

        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Message(WsMessage::Binary(vec![1, 2, 3]))
        );
    }

    // ── Staleness and races ─────────────────────────────────────────

    #[tokio::test]
    async fn explicit_close_wins_over_racing_close_frame() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();

        // A server close frame is already queued when the explicit close
        // claims the handle; the loop must lose the race and stay silent.
        scripted.feed_frame(Frame::Close {
            code: CloseCode::Away,
            reason: Some("server racing".into()),
        });
        client
            .ensure_close(Some(CloseCode::Normal), Some("client first"), &token())
            .await;

        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::Normal, Some("client first".into()))
        );
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn superseded_receive_loop_aborts_stale_handle_silently() {
        let first = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let second = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![
            Arc::clone(&first.transport),
            Arc::clone(&second.transport),
        ]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();

        // The first transport dies without waking its receive loop.
        first.set_state(TransportState::Closed);
        assert!(!client.is_open());

        // Reopen binds a fresh handle; the first loop is now stale.
        client.open(&token()).await.unwrap();
        assert!(client.is_open());

        // Waking the stale loop must abort its own handle without emitting.
        first.feed_text("stale traffic");
        second.feed_text("fresh traffic");

        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Message(WsMessage::Text("fresh traffic".into()))
        );
        expect_no_event(&mut events).await;
        assert!(first.aborts() >= 1);
    }

    // ── Disposal and subscriptions ──────────────────────────────────

    #[tokio::test]
    async fn dispose_aborts_and_silences_everything() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);
        let mut events = watch_events(&client);

        client.open(&token()).await.unwrap();
        client.dispose();

        assert!(scripted.aborts() >= 1);
        assert!(!client.is_open());
        expect_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn drop_aborts_the_current_handle() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        client.open(&token()).await.unwrap();
        drop(client);

        assert!(scripted.aborts() >= 1);
    }

    #[tokio::test]
    async fn unsubscribed_handler_stops_firing() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = client.on_message(move |message| {
            let _ = tx.send(message.clone());
        });

        client.open(&token()).await.unwrap();
        assert!(client.unsubscribe(id));
        assert!(!client.unsubscribe(id));

        scripted.feed_text("unseen");
        let outcome = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(outcome.is_err(), "handler fired after unsubscribe");
    }

    // ── Config ──────────────────────────────────────────────────────

    #[test]
    fn config_defaults() {
        let config = WsClientConfig::new("ws://example.test/ws");
        assert_eq!(config.url, "ws://example.test/ws");
        assert_eq!(config.default_close_code, CloseCode::Normal);
        assert!(config.default_close_reason.is_empty());
    }

    #[test]
    fn config_builder_methods() {
        let config = WsClientConfig::new("ws://example.test/ws")
            .with_default_close_code(CloseCode::Away)
            .with_default_close_reason("done");
        assert_eq!(config.default_close_code, CloseCode::Away);
        assert_eq!(config.default_close_reason, "done");
    }

    #[tokio::test]
    async fn debug_impl_reports_lifecycle() {
        let scripted = Scripted::new(OpenBehavior::Succeed, CloseBehavior::Succeed);
        let client = client_with(vec![Arc::clone(&scripted.transport)]);

        client.open(&token()).await.unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("WsClient"));
        assert!(debug.contains("open: true"));
    }
}
