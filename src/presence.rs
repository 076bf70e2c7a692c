//! Process-wide presence registry.
//!
//! Maps each authenticated user id to the single live session handle for
//! that identity. This is the only state shared across sessions; it is
//! guarded by one process-wide mutex whose critical sections cover map
//! mutation only — no socket or store I/O happens under the lock.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::mpsc;

use crate::db::models::UserId;
use crate::ws::frame::Frame;

/// Cloneable handle to a live session's outbound write queue.
/// All writes to a session's socket are funneled through this queue and
/// drained by that session's single writer task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: mpsc::UnboundedSender<Message>,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { outbound }
    }

    /// Serialize a frame and queue it for the session's writer task.
    /// Fails only if the session's writer has already gone away.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let text = serde_json::to_string(frame).map_err(|_| SendError)?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| SendError)
    }

    /// Queue a raw WebSocket message (ping, close) for the writer task.
    pub fn send_raw(&self, msg: Message) -> Result<(), SendError> {
        self.outbound.send(msg).map_err(|_| SendError)
    }
}

/// The peer's outbound queue is closed — its session is tearing down.
#[derive(Debug)]
pub struct SendError;

/// Single-owner registry service, constructed once at process start.
pub struct PresenceRegistry {
    inner: Mutex<HashMap<UserId, SessionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session, unconditionally replacing any prior entry for
    /// the same identity. The superseded connection is not closed; it is
    /// orphaned in place and tears itself down via its own read loop.
    pub fn register(&self, user_id: UserId, handle: SessionHandle) {
        let mut map = self.lock();
        if map.insert(user_id, handle).is_some() {
            tracing::warn!(user_id, "superseding existing live connection");
        }
    }

    /// Absence is a normal result: the peer is offline.
    pub fn lookup(&self, user_id: UserId) -> Option<SessionHandle> {
        self.lock().get(&user_id).cloned()
    }

    /// Remove the entry if present; no-op otherwise.
    pub fn remove(&self, user_id: UserId) {
        self.lock().remove(&user_id);
    }

    /// Ids of all currently online users.
    pub fn snapshot(&self) -> Vec<UserId> {
        self.lock().keys().copied().collect()
    }

    /// Close every live session. Called once at process shutdown.
    pub fn close_all(&self) {
        let handles: Vec<(UserId, SessionHandle)> =
            self.lock().drain().collect();
        for (user_id, handle) in handles {
            tracing::info!(user_id, "closing session for shutdown");
            let _ = handle.send_raw(Message::Close(Some(CloseFrame {
                code: 1001,
                reason: "Server shutting down".into(),
            })));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, SessionHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
