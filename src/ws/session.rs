//! Per-connection session lifecycle.
//!
//! Each WebSocket runs an explicit state machine:
//!
//! ```text
//! Connecting -> Authenticated -> Active -> Closing -> Closed
//! ```
//!
//! Three tasks cooperate per connection: this read/dispatch loop, a writer
//! task that solely owns the sink (every outbound write — replay, forwards,
//! acks, heartbeat pings — goes through one mpsc queue), and a heartbeat
//! ticker. A shared CancellationToken ties them together: teardown cancels
//! it to stop the heartbeat deterministically, and a sink write failure
//! cancels it so the read loop observes the dead socket.

use axum::extract::ws::{Message, WebSocket};
use chrono::{SecondsFormat, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::models::UserId;
use crate::presence::SessionHandle;
use crate::state::AppState;
use crate::ws::frame::{kind, Frame};

/// Named session states. Transitions are driven exclusively by `Session::run`.
enum SessionState {
    /// Waiting for the single handshake frame.
    Connecting,
    /// Handshake frame received; credential not yet verified.
    Authenticated { credential: String },
    /// Registered and serving live traffic.
    Active { user_id: UserId },
    /// Tearing down: deregister, stop heartbeat, close socket.
    Closing(CloseReason),
    /// Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Bad/missing credential, malformed or wrong first frame, or
    /// handshake deadline expiry. Dropped silently, no close frame.
    HandshakeFailed,
    /// Peer sent a `disconnect` frame.
    ClientDisconnect,
    /// Peer closed the WebSocket.
    ClientClosed,
    /// Malformed frame during Active.
    ProtocolError,
    /// Transport-level read failure.
    ReadError,
    /// Stream ended without a close frame.
    StreamEnded,
    /// No inbound traffic within the read deadline.
    IdleTimeout,
    /// The writer task hit a socket write failure (heartbeat probe or
    /// outbound frame).
    WriteFailed,
}

/// Outcome of dispatching one inbound frame while Active.
enum Dispatch {
    Continue,
    Disconnect,
    Fatal,
}

/// Entry point for an upgraded WebSocket. Returns when the session reaches
/// `Closed` and the writer task has drained.
pub async fn run_session(socket: WebSocket, app: AppState) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let cancel = CancellationToken::new();

    let writer = tokio::spawn(writer_task(sink, rx, cancel.clone()));

    let mut session = Session {
        stream,
        handle: SessionHandle::new(tx),
        app,
        cancel,
        user_id: None,
    };
    session.run().await;

    // Dropping the session drops the outbound sender; the writer exits
    // after flushing whatever is still queued (including the close frame).
    drop(session);
    let _ = writer.await;
}

/// Writer task: single owner of the WebSocket sink.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            // Socket write failure is fatal for the whole session; the
            // read loop learns about it through the token.
            cancel.cancel();
            break;
        }
    }
}

/// Heartbeat scheduler: periodic liveness probes on the session's socket,
/// through the same writer queue as all other outbound traffic. Stops when
/// the session token is cancelled at teardown.
async fn heartbeat_task(handle: SessionHandle, cancel: CancellationToken, period: Duration) {
    let mut ticker = interval(period);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if handle.send_raw(Message::Ping(vec![].into())).is_err() {
                    // Writer task has died — connection is gone
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

struct Session {
    stream: SplitStream<WebSocket>,
    handle: SessionHandle,
    app: AppState,
    cancel: CancellationToken,
    /// Set once the handshake binds an identity; used by teardown.
    user_id: Option<UserId>,
}

impl Session {
    async fn run(&mut self) {
        let mut state = SessionState::Connecting;
        loop {
            state = match state {
                SessionState::Connecting => self.connecting().await,
                SessionState::Authenticated { credential } => self.authenticate(credential).await,
                SessionState::Active { user_id } => self.active(user_id).await,
                SessionState::Closing(reason) => self.teardown(reason),
                SessionState::Closed => break,
            };
        }
    }

    /// Wait for exactly one protocol frame within the read deadline; it
    /// must be a `connect` frame carrying a credential. Transport control
    /// frames (client keepalives, proxy pings) are answered and skipped;
    /// they neither complete nor extend the handshake window.
    async fn connecting(&mut self) -> SessionState {
        let deadline = Instant::now() + self.app.read_deadline;
        let text = loop {
            match timeout_at(deadline, self.stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => break text,
                Ok(Some(Ok(Message::Ping(data)))) => {
                    let _ = self.handle.send_raw(Message::Pong(data));
                }
                Ok(Some(Ok(Message::Pong(_)))) => {}
                Ok(_) => {
                    tracing::debug!("handshake failed: no readable text frame");
                    return SessionState::Closing(CloseReason::HandshakeFailed);
                }
                Err(_) => {
                    tracing::debug!("handshake failed: deadline expired");
                    return SessionState::Closing(CloseReason::HandshakeFailed);
                }
            }
        };

        let frame = match Frame::decode(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "handshake failed: malformed frame");
                return SessionState::Closing(CloseReason::HandshakeFailed);
            }
        };

        if frame.kind != kind::CONNECT {
            tracing::debug!(kind = %frame.kind, "handshake failed: first frame is not connect");
            return SessionState::Closing(CloseReason::HandshakeFailed);
        }

        match frame.token {
            Some(credential) => SessionState::Authenticated { credential },
            None => {
                tracing::debug!("handshake failed: connect frame without credential");
                SessionState::Closing(CloseReason::HandshakeFailed)
            }
        }
    }

    /// Verify the credential, bind the identity, register with the
    /// presence registry and start the heartbeat. Verification failure
    /// drops the connection without a response frame (silent deny).
    async fn authenticate(&mut self, credential: String) -> SessionState {
        let user_id = match self.app.verifier.verify_identity(&credential) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket authentication failed");
                return SessionState::Closing(CloseReason::HandshakeFailed);
            }
        };

        self.user_id = Some(user_id);
        self.app.registry.register(user_id, self.handle.clone());

        // Heartbeat ticks at 90% of the read deadline, same ratio the
        // idle timeout is measured against.
        let period = (self.app.read_deadline * 9) / 10;
        tokio::spawn(heartbeat_task(
            self.handle.clone(),
            self.cancel.clone(),
            period,
        ));

        tracing::info!(user_id, "session active");
        SessionState::Active { user_id }
    }

    /// Replay undelivered messages, then serve the read/dispatch loop.
    /// The read deadline re-arms on every successfully read frame.
    async fn active(&mut self, user_id: UserId) -> SessionState {
        self.replay_undelivered(user_id).await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return SessionState::Closing(CloseReason::WriteFailed);
                }
                next = timeout(self.app.read_deadline, self.stream.next()) => match next {
                    Err(_) => return SessionState::Closing(CloseReason::IdleTimeout),
                    Ok(None) => return SessionState::Closing(CloseReason::StreamEnded),
                    Ok(Some(Err(e))) => {
                        tracing::warn!(user_id, error = %e, "WebSocket receive error");
                        return SessionState::Closing(CloseReason::ReadError);
                    }
                    Ok(Some(Ok(msg))) => match msg {
                        Message::Text(text) => match self.dispatch(user_id, text.as_str()).await {
                            Dispatch::Continue => {}
                            Dispatch::Disconnect => {
                                return SessionState::Closing(CloseReason::ClientDisconnect);
                            }
                            Dispatch::Fatal => {
                                return SessionState::Closing(CloseReason::ProtocolError);
                            }
                        },
                        Message::Ping(data) => {
                            let _ = self.handle.send_raw(Message::Pong(data));
                        }
                        Message::Pong(_) => {
                            // Liveness confirmed; the deadline re-arms on
                            // the next loop iteration.
                        }
                        Message::Close(_) => {
                            return SessionState::Closing(CloseReason::ClientClosed);
                        }
                        Message::Binary(_) => {
                            tracing::debug!(user_id, "ignoring binary message on text protocol");
                        }
                    }
                }
            }
        }
    }

    /// Deregister, stop the heartbeat, close the socket. Terminal.
    fn teardown(&mut self, reason: CloseReason) -> SessionState {
        if let Some(user_id) = self.user_id {
            self.app.registry.remove(user_id);
            tracing::info!(user_id, ?reason, "session closed");
        } else {
            tracing::debug!(?reason, "unauthenticated session closed");
        }

        // Stop the heartbeat task
        self.cancel.cancel();

        // Handshake failures are dropped silently, without a close frame
        if reason != CloseReason::HandshakeFailed {
            let _ = self.handle.send_raw(Message::Close(None));
        }

        SessionState::Closed
    }

    /// Send all undelivered messages for this identity, oldest first,
    /// marking each delivered. Runs before any live traffic is processed.
    /// Store failures are logged and skipped — delivery is best effort and
    /// unsent rows simply stay queued for the next session.
    async fn replay_undelivered(&mut self, user_id: UserId) {
        let pending = match self.app.store.list_undelivered(user_id).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(user_id, error = %e, "failed to fetch undelivered messages");
                return;
            }
        };

        if pending.is_empty() {
            return;
        }

        tracing::info!(user_id, count = pending.len(), "replaying undelivered messages");
        for msg in pending {
            if self.handle.send_frame(&Frame::from_stored(&msg)).is_err() {
                // Writer is gone; the read loop will observe the dead
                // socket. Remaining rows stay undelivered.
                return;
            }
            if let Err(e) = self.app.store.mark_delivered(msg.id).await {
                tracing::error!(user_id, message_id = msg.id, error = %e, "failed to mark replayed message delivered");
            }
        }
    }

    /// Dispatch one inbound frame per the protocol table. Malformed JSON is
    /// fatal; unknown frame types are ignored.
    async fn dispatch(&mut self, user_id: UserId, text: &str) -> Dispatch {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "malformed frame; closing session");
                return Dispatch::Fatal;
            }
        };

        match frame.kind.as_str() {
            kind::MESSAGE => self.handle_message(user_id, frame).await,
            kind::TYPING => self.handle_typing(user_id, frame),
            kind::DISCONNECT => {
                tracing::info!(user_id, "client requested disconnect");
                return Dispatch::Disconnect;
            }
            kind::CONNECT => {
                tracing::debug!(user_id, "ignoring connect frame outside handshake");
            }
            other => {
                tracing::warn!(user_id, kind = %other, "ignoring unknown frame type");
            }
        }

        Dispatch::Continue
    }

    /// Persist and route one chat message. The claimed sender must match
    /// the session's authenticated identity; spoofed frames are dropped
    /// without a response. Persistence is at-most-once: a store failure
    /// drops the message for this attempt and the sender gets no ack.
    async fn handle_message(&mut self, user_id: UserId, frame: Frame) {
        if frame.sender_id != Some(user_id) {
            tracing::warn!(
                user_id,
                claimed_sender = ?frame.sender_id,
                "dropping message with mismatched sender id"
            );
            return;
        }
        let Some(receiver_id) = frame.receiver_id else {
            tracing::warn!(user_id, "dropping message without receiver id");
            return;
        };
        let content = frame.content.unwrap_or_default();

        // Server receive time, not the client's claimed timestamp
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let saved = match self
            .app
            .store
            .insert(user_id, receiver_id, content, created_at)
            .await
        {
            Ok(saved) => saved,
            Err(e) => {
                tracing::error!(user_id, error = %e, "failed to persist message; dropping");
                return;
            }
        };

        match self.app.registry.lookup(receiver_id) {
            Some(peer) => {
                if peer.send_frame(&Frame::from_stored(&saved)).is_err() {
                    // Receiver's session is tearing down; its own read
                    // loop handles the cleanup.
                    tracing::warn!(receiver_id, message_id = saved.id, "forward to online receiver failed");
                }
                if let Err(e) = self.app.store.mark_delivered(saved.id).await {
                    tracing::error!(message_id = saved.id, error = %e, "failed to mark message delivered");
                }
                let _ = self.handle.send_frame(&Frame::delivered());
            }
            None => {
                tracing::debug!(receiver_id, message_id = saved.id, "receiver offline; stored for replay");
            }
        }
    }

    /// Relay an ephemeral typing indicator. Never persisted; silently a
    /// no-op when the receiver is offline.
    fn handle_typing(&self, user_id: UserId, frame: Frame) {
        let Some(receiver_id) = frame.receiver_id else {
            return;
        };
        if let Some(peer) = self.app.registry.lookup(receiver_id) {
            let _ = peer.send_frame(&Frame::typing(user_id, receiver_id, frame.status));
        }
    }
}
