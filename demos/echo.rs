//! # Echo Example
//!
//! Demonstrates a complete client lifecycle against a WebSocket echo
//! server:
//!
//! 1. Open a connection
//! 2. Subscribe to message, closed, and error events
//! 3. Send a few messages and watch them echo back
//! 4. Close gracefully on Ctrl+C or once the echoes arrive
//!
//! ## Running
//!
//! ```sh
//! # Start any WebSocket echo server on localhost:9001, then:
//! cargo run --example echo
//!
//! # Override the server URL:
//! WS_ECHO_URL=ws://my-server:9001 cargo run --example echo
//! ```

use tokio_util::sync::CancellationToken;
use ws_lifecycle_client::{CloseCode, WsClient, WsClientConfig};

/// Default server URL when `WS_ECHO_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:9001";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Initialize tracing. Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("WS_ECHO_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    tracing::info!("Connecting to {url}");

    let client = WsClient::websocket(WsClientConfig::new(url));

    // ── Subscriptions ───────────────────────────────────────────────
    // Forward events into channels so this task can await them.
    let (echo_tx, mut echo_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_message(move |message| {
        let _ = echo_tx.send(message.clone());
    });
    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_closed(move |code, reason| {
        tracing::info!("connection closed: {code} {reason:?}");
        let _ = closed_tx.send(());
    });
    client.on_error(|error| {
        tracing::warn!("transport error: {error}");
    });

    // ── Lifecycle ───────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    client.open(&cancel).await?;
    tracing::info!("connection open: {}", client.is_open());

    let outbound = ["one", "two", "three"];
    for text in outbound {
        client.send_text(text, &cancel).await?;
    }

    // ── Event loop ──────────────────────────────────────────────────
    // Wait for every echo, but let Ctrl+C cut the session short.
    let mut received = 0;
    while received < outbound.len() {
        tokio::select! {
            Some(message) = echo_rx.recv() => {
                tracing::info!("echoed back: {message:?}");
                received += 1;
            }
            // The connection ended underneath us; the subscriber above
            // already reported why.
            _ = closed_rx.recv() => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, closing");
                break;
            }
        }
    }

    client
        .ensure_close(Some(CloseCode::Normal), Some("done"), &cancel)
        .await;
    Ok(())
}
