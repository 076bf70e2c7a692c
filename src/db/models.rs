//! Database row types. These correspond 1:1 to the SQLite schema
//! defined in migrations.rs.

use serde::Serialize;

/// Authenticated user identity as resolved from a credential.
pub type UserId = i64;

/// Persisted chat message in the chats table.
/// `delivered` transitions false -> true exactly once and never reverts;
/// `created_at` (RFC 3339, server-assigned) is immutable after insert.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: String,
    pub delivered: bool,
}
