//! Wire frames for the chat WebSocket.
//!
//! Frames are self-delimited JSON text messages with a mandatory `type`
//! field; all other fields are interpreted per type. `type` is kept as a
//! plain string so that unrecognized types decode cleanly and can be
//! ignored instead of killing the session.

use serde::{Deserialize, Serialize};

use crate::db::models::{ChatMessage, UserId};

/// Frame type values.
pub mod kind {
    pub const CONNECT: &str = "connect";
    pub const MESSAGE: &str = "message";
    pub const TYPING: &str = "typing";
    pub const DELIVERED: &str = "delivered";
    pub const DISCONNECT: &str = "disconnect";
}

/// One discrete protocol message exchanged over the persistent connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    /// Bearer credential; only meaningful on `connect`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Frame {
    /// Chat message frame, as forwarded to a receiver or replayed on
    /// reconnect.
    pub fn message(sender_id: UserId, receiver_id: UserId, content: &str, timestamp: &str) -> Self {
        Self {
            kind: kind::MESSAGE.to_string(),
            sender_id: Some(sender_id),
            receiver_id: Some(receiver_id),
            content: Some(content.to_string()),
            timestamp: Some(timestamp.to_string()),
            ..Self::default()
        }
    }

    /// Replay form of a stored message.
    pub fn from_stored(msg: &ChatMessage) -> Self {
        Self::message(msg.sender_id, msg.receiver_id, &msg.content, &msg.created_at)
    }

    /// Ephemeral typing indicator relayed to the receiver.
    pub fn typing(sender_id: UserId, receiver_id: UserId, status: Option<String>) -> Self {
        Self {
            kind: kind::TYPING.to_string(),
            sender_id: Some(sender_id),
            receiver_id: Some(receiver_id),
            status,
            ..Self::default()
        }
    }

    /// Delivery acknowledgment sent back to the message's sender.
    pub fn delivered() -> Self {
        Self {
            kind: kind::DELIVERED.to_string(),
            ..Self::default()
        }
    }

    /// Decode a frame from the text payload of a WebSocket message.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
