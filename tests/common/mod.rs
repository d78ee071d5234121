#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for the lifecycle client integration tests.
//!
//! Provides a channel-driven [`ScriptedTransport`] whose inbound traffic is
//! fed from the test body, plus event-collection helpers for asserting on
//! the client's observable notifications.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use ws_lifecycle_client::{
    CloseCode, Frame, MessageKind, Result, Transport, TransportState, WsClient, WsClientConfig,
    WsClientError, WsMessage,
};

// ── ScriptedTransport ───────────────────────────────────────────────

pub enum Script {
    Frame(Frame),
    Error(String),
    /// End the inbound stream without a close frame.
    End,
}

/// A scripted transport handle driven from the test body.
///
/// `open` always succeeds and `close` always reaches the closed state;
/// inbound traffic is whatever the test feeds through its [`Scripted`]
/// controls. Outgoing messages are recorded for inspection.
pub struct ScriptedTransport {
    state: StdMutex<TransportState>,
    frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<Script>>,
    abort_notify: Notify,
    aborts: AtomicUsize,
    sent: StdMutex<Vec<WsMessage>>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _url: &str, _cancel: &CancellationToken) -> Result<()> {
        *self.state.lock().unwrap() = TransportState::Open;
        Ok(())
    }

    async fn send(&self, message: WsMessage, _cancel: &CancellationToken) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(
        &self,
        _code: CloseCode,
        _reason: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        *self.state.lock().unwrap() = TransportState::Closed;
        Ok(())
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = TransportState::Aborted;
        self.abort_notify.notify_waiters();
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
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
pub struct Scripted {
    pub transport: Arc<ScriptedTransport>,
    feed: mpsc::UnboundedSender<Script>,
}

impl Scripted {
    pub fn new() -> Self {
        let (feed, rx) = mpsc::unbounded_channel();
        Self {
            transport: Arc::new(ScriptedTransport {
                state: StdMutex::new(TransportState::None),
                frames: tokio::sync::Mutex::new(rx),
                abort_notify: Notify::new(),
                aborts: AtomicUsize::new(0),
                sent: StdMutex::new(Vec::new()),
            }),
            feed,
        }
    }

    pub fn feed_text(&self, text: &str) {
        self.feed_frame(Frame::Data {
            kind: MessageKind::Text,
            payload: text.as_bytes().to_vec(),
            fin: true,
        });
    }

    pub fn feed_binary(&self, payload: Vec<u8>) {
        self.feed_frame(Frame::Data {
            kind: MessageKind::Binary,
            payload,
            fin: true,
        });
    }

    pub fn feed_frame(&self, frame: Frame) {
        self.feed.send(Script::Frame(frame)).unwrap();
    }

    pub fn feed_close(&self, code: CloseCode, reason: Option<&str>) {
        self.feed_frame(Frame::Close {
            code,
            reason: reason.map(str::to_owned),
        });
    }

    pub fn feed_error(&self, message: &str) {
        self.feed.send(Script::Error(message.into())).unwrap();
    }

    pub fn feed_end(&self) {
        self.feed.send(Script::End).unwrap();
    }

    pub fn sent(&self) -> Vec<WsMessage> {
        self.transport.sent.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> usize {
        self.transport.aborts.load(Ordering::SeqCst)
    }
}

/// Build a client whose factory hands out the given scripted handles, one
/// per open attempt, in order.
pub fn client_with(handles: Vec<Arc<ScriptedTransport>>) -> WsClient {
    let queue = StdMutex::new(VecDeque::from(handles));
    WsClient::new(WsClientConfig::new("scripted://test"), move || {
        let transport: Arc<dyn Transport> = queue
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted factory exhausted");
        transport
    })
}

// ── Event collection ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    Message(WsMessage),
    Closed(CloseCode, Option<String>),
    Error(String),
}

/// Subscribe to all three event streams and forward them into one channel,
/// preserving emission order per stream.
pub fn watch_events(client: &WsClient) -> mpsc::UnboundedReceiver<TestEvent> {
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

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn expect_no_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) {
    let outcome = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(outcome.is_err(), "unexpected event: {:?}", outcome.unwrap());
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}
