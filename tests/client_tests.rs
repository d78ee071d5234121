#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration-style lifecycle tests for the client.
//!
//! Uses the shared `ScriptedTransport` from `tests/common` to drive whole
//! connection lifecycles through the public API: open, traffic, graceful
//! and abrupt teardown, and reconnect cycles.

mod common;

use std::sync::Arc;

use ws_lifecycle_client::{CloseCode, WsClientError, WsMessage};

use common::{client_with, expect_no_event, next_event, token, watch_events, Scripted, TestEvent};

// ════════════════════════════════════════════════════════════════════
// Full lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_lifecycle_open_send_receive_close() {
    let scripted = Scripted::new();
    let client = client_with(vec![Arc::clone(&scripted.transport)]);
    let mut events = watch_events(&client);

    client.open(&token()).await.unwrap();
    assert!(client.is_open());

    client.send_text("hello server", &token()).await.unwrap();
    assert_eq!(scripted.sent(), vec![WsMessage::Text("hello server".into())]);

    scripted.feed_text("hello client");
    assert_eq!(
        next_event(&mut events).await,
        TestEvent::Message(WsMessage::Text("hello client".into()))
    );

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
async fn binary_traffic_round_trips() {
    let scripted = Scripted::new();
    let client = client_with(vec![Arc::clone(&scripted.transport)]);
    let mut events = watch_events(&client);

    client.open(&token()).await.unwrap();
    client.send_binary(vec![1, 2, 3], &token()).await.unwrap();
    assert_eq!(scripted.sent(), vec![WsMessage::Binary(vec![1, 2, 3])]);

    scripted.feed_binary(vec![4, 5]);
    assert_eq!(
        next_event(&mut events).await,
        TestEvent::Message(WsMessage::Binary(vec![4, 5]))
    );
}

// ════════════════════════════════════════════════════════════════════
// Reconnect cycles
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reopen_after_close_uses_a_fresh_transport() {
    let first = Scripted::new();
    let second = Scripted::new();
    let client = client_with(vec![
        Arc::clone(&first.transport),
        Arc::clone(&second.transport),
    ]);
    let mut events = watch_events(&client);

    client.open(&token()).await.unwrap();
    client.ensure_close(None, None, &token()).await;
    assert_eq!(
        next_event(&mut events).await,
        TestEvent::Closed(CloseCode::Normal, None)
    );

    client.open(&token()).await.unwrap();
    assert!(client.is_open());

    // Traffic flows over the second handle; the first records none of it.
    client.send_text("second life", &token()).await.unwrap();
    assert!(first.sent().is_empty());
    assert_eq!(second.sent(), vec![WsMessage::Text("second life".into())]);
}

#[tokio::test]
async fn closed_fires_exactly_once_per_connection() {
    let first = Scripted::new();
    let second = Scripted::new();
    let client = client_with(vec![
        Arc::clone(&first.transport),
        Arc::clone(&second.transport),
    ]);
    let mut events = watch_events(&client);

    for reason in ["first down", "second down"] {
        client.open(&token()).await.unwrap();
        client
            .ensure_close(Some(CloseCode::Normal), Some(reason), &token())
            .await;
        assert_eq!(
            next_event(&mut events).await,
            TestEvent::Closed(CloseCode::Normal, Some(reason.into()))
        );
    }
    expect_no_event(&mut events).await;
}

#[tokio::test]
async fn handlers_survive_reconnects() {
    let first = Scripted::new();
    let second = Scripted::new();
    let client = client_with(vec![
        Arc::clone(&first.transport),
        Arc::clone(&second.transport),
    ]);
    let mut events = watch_events(&client);

    client.open(&token()).await.unwrap();
    first.feed_text("from first");
    assert_eq!(
        next_event(&mut events).await,
        TestEvent::Message(WsMessage::Text("from first".into()))
    );

    client.ensure_close(None, None, &token()).await;
    assert!(matches!(
        next_event(&mut events).await,
        TestEvent::Closed(CloseCode::Normal, _)
    ));

    // The same subscriptions keep firing on the next connection.
    client.open(&token()).await.unwrap();
    second.feed_text("from second");
    assert_eq!(
        next_event(&mut events).await,
        TestEvent::Message(WsMessage::Text("from second".into()))
    );
}

// ════════════════════════════════════════════════════════════════════
// Server-initiated and abrupt teardown
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn server_initiated_close_then_reopen() {
    let first = Scripted::new();
    let second = Scripted::new();
    let client = client_with(vec![
        Arc::clone(&first.transport),
        Arc::clone(&second.transport),
    ]);
    let mut events = watch_events(&client);

    client.open(&token()).await.unwrap();
    first.feed_close(CloseCode::Away, Some("server restarting"));

    assert_eq!(
        next_event(&mut events).await,
        TestEvent::Closed(CloseCode::Away, Some("server restarting".into()))
    );
    assert!(!client.is_open());

    client.open(&token()).await.unwrap();
    assert!(client.is_open());
}

#[tokio::test]
async fn abrupt_disconnect_reports_no_status() {
    let scripted = Scripted::new();
    let client = client_with(vec![Arc::clone(&scripted.transport)]);
    let mut events = watch_events(&client);

    client.open(&token()).await.unwrap();
    scripted.feed_end();

    assert_eq!(
        next_event(&mut events).await,
        TestEvent::Closed(CloseCode::NoStatus, None)
    );
    assert!(!client.is_open());
    expect_no_event(&mut events).await;
}

#[tokio::test]
async fn receive_failure_reports_error_then_away() {
    let first = Scripted::new();
    let second = Scripted::new();
    let client = client_with(vec![
        Arc::clone(&first.transport),
        Arc::clone(&second.transport),
    ]);
    let mut events = watch_events(&client);

    client.open(&token()).await.unwrap();
    first.feed_error("connection reset by peer");

    let error = next_event(&mut events).await;
    assert!(
        matches!(&error, TestEvent::Error(message) if message.contains("connection reset")),
        "expected Error event, got {error:?}"
    );
    let closed = next_event(&mut events).await;
    assert!(
        matches!(&closed, TestEvent::Closed(CloseCode::Away, Some(_))),
        "expected Closed(Away), got {closed:?}"
    );
    assert!(first.aborts() >= 1);

    // The client remains usable after the failure.
    client.open(&token()).await.unwrap();
    assert!(client.is_open());
}

// ════════════════════════════════════════════════════════════════════
// State guards through the public API
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn send_on_closed_connection_is_invalid_state() {
    let scripted = Scripted::new();
    let client = client_with(vec![Arc::clone(&scripted.transport)]);

    client.open(&token()).await.unwrap();
    client.ensure_close(None, None, &token()).await;

    let err = client.send_text("too late", &token()).await.unwrap_err();
    assert!(matches!(err, WsClientError::InvalidState));
    assert!(scripted.sent().is_empty());
}

#[tokio::test]
async fn double_open_is_rejected_without_a_second_transport() {
    let scripted = Scripted::new();
    // Only one handle is provisioned; a second factory call would panic.
    let client = client_with(vec![Arc::clone(&scripted.transport)]);

    client.open(&token()).await.unwrap();
    let err = client.open(&token()).await.unwrap_err();
    assert!(matches!(err, WsClientError::InvalidState));
    assert!(client.is_open());
}
