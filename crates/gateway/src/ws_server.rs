//! Downstream WebSocket server built on Axum.
//!
//! Sessions are installed in the registry only after the upgrade completes,
//! so a half-open connection can never be broadcast to. Each session gets a
//! writer task draining its outbox, keeping writes queued and ordered.

use crate::bridge::SubscriptionBridge;
use crate::session::{SessionRegistry, SessionState};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared state for the WebSocket routes.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub bridge: Arc<SubscriptionBridge>,
    /// Frame mode stamped on every accepted session.
    pub binary_frames: bool,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.registry.count();
    let subscriptions = state.bridge.subscription_count();
    format!(
        r#"{{"status":"ok","sessions":{},"subscriptions":{}}}"#,
        sessions, subscriptions
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Drive one downstream connection from handshake to close.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session = Arc::new(SessionState::new(tx, state.binary_frames));
    let session_id = state.registry.register(session.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_sessions").set(state.registry.count() as f64);

    info!(
        "Session {} connected ({} frames)",
        session_id,
        if state.binary_frames { "binary" } else { "text" }
    );

    // Writer task: one outstanding write at a time, in queue order.
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        state.bridge.handle_downstream(&session, text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => state.bridge.handle_downstream(&session, text),
                            Err(_) => debug!("Session {} sent non-UTF8 binary frame", session_id),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if session.enqueue(Message::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        warn!("Session {} transport error: {:?}", session_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if session.enqueue(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        }
    }

    // Release the session before sweeping so its registry entries expire now.
    state.registry.unregister(&session_id);
    drop(session);
    state.bridge.sweep();
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_sessions").set(state.registry.count() as f64);

    info!("Session {} disconnected", session_id);
}
