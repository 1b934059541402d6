//! Event callbacks for the upstream WebSocket connection.

use async_trait::async_trait;

/// Callbacks invoked by [`crate::WsClient`] as the connection progresses.
///
/// `on_open` fires exactly once after the handshake completes, before any
/// `on_message`. `on_close` fires at most once, after the read loop exits.
#[async_trait]
pub trait WsEvents: Send + Sync + 'static {
    /// The handshake completed and frames may now be sent.
    async fn on_open(&self) {}

    /// A text frame arrived from the exchange.
    async fn on_message(&self, payload: &str);

    /// The read loop exited and the connection is gone.
    async fn on_close(&self) {}

    /// A transport error that is not part of a normal teardown.
    async fn on_error(&self, message: &str) {
        let _ = message;
    }
}
