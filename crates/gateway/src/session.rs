//! Downstream session state and registry.

use crate::error::{GatewayError, Result};
use axum::extract::ws::{close_code, CloseFrame, Message};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique session identifier.
pub type SessionId = Uuid;

/// State for one connected downstream client.
///
/// The registry and any live subscription fan-out share ownership through
/// `Arc`; subscriptions themselves hold only weak references, so a session
/// never outlives its connection because of them.
pub struct SessionState {
    /// Unique session identifier.
    pub id: SessionId,
    /// Queue drained by the session's writer task; one outstanding write at
    /// a time on the socket, in send order.
    outbox: mpsc::UnboundedSender<Message>,
    /// Frame mode for outbound payloads.
    binary: bool,
    /// Timestamp when the session connected, epoch millis.
    pub connected_at: i64,
}

impl SessionState {
    pub fn new(outbox: mpsc::UnboundedSender<Message>, binary: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbox,
            binary,
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Queue a payload for this session using its negotiated frame mode.
    pub fn send(&self, payload: &str) -> Result<()> {
        let message = if self.binary {
            Message::Binary(payload.as_bytes().to_vec().into())
        } else {
            Message::Text(payload.to_string().into())
        };
        self.enqueue(message)
    }

    /// Queue a raw frame (ping/pong/close).
    pub(crate) fn enqueue(&self, message: Message) -> Result<()> {
        self.outbox
            .send(message)
            .map_err(|_| GatewayError::SessionSend)
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }
}

/// Registry of live downstream sessions. Holds the strong references; the
/// last one is released when the session's connection task finishes.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session. Called only once its handshake has completed.
    pub fn register(&self, session: Arc<SessionState>) -> SessionId {
        let id = session.id;
        self.sessions.insert(id, session);
        info!("Session {} registered", id);
        id
    }

    pub fn unregister(&self, id: &SessionId) -> Option<Arc<SessionState>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            info!("Session {} unregistered", id);
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionState>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Send a payload to every live session.
    pub fn broadcast(&self, payload: &str) {
        for entry in self.sessions.iter() {
            if entry.value().send(payload).is_err() {
                debug!("Broadcast to session {} failed", entry.key());
            }
        }
    }

    /// Queue a normal close frame on every session and drop them all.
    /// Safe to call more than once.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            let _ = entry.value().enqueue(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "server shutdown".into(),
            })));
        }
        self.sessions.clear();
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
