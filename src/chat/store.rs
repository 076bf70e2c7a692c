//! Message store adapter: the persistence boundary for chat messages.
//!
//! rusqlite is synchronous, so every operation clones the shared pool and
//! runs its queries inside tokio::task::spawn_blocking. Callers treat
//! failures as local persistence failures — nothing here retries.

use std::collections::HashMap;

use rusqlite::params;

use crate::db::models::{ChatMessage, UserId};
use crate::db::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Cheap-to-clone handle over the shared SQLite connection.
#[derive(Clone)]
pub struct MessageStore {
    db: DbPool,
}

impl MessageStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Persist a new message with delivered=false and return the stored row.
    pub async fn insert(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        created_at: String,
    ) -> Result<ChatMessage, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            conn.execute(
                "INSERT INTO chats (sender_id, receiver_id, content, created_at, delivered)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![sender_id, receiver_id, content, created_at],
            )?;
            Ok(ChatMessage {
                id: conn.last_insert_rowid(),
                sender_id,
                receiver_id,
                content,
                created_at,
                delivered: false,
            })
        })
        .await?
    }

    /// Flip a message's delivered flag. false -> true only; the update is
    /// idempotent and never reverts the flag.
    pub async fn mark_delivered(&self, message_id: i64) -> Result<(), StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            conn.execute(
                "UPDATE chats SET delivered = 1 WHERE id = ?1",
                params![message_id],
            )?;
            Ok(())
        })
        .await?
    }

    /// All undelivered messages addressed to a user, oldest first.
    /// Drives the replay phase of a fresh session.
    pub async fn list_undelivered(&self, user_id: UserId) -> Result<Vec<ChatMessage>, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, created_at, delivered
                 FROM chats
                 WHERE receiver_id = ?1 AND delivered = 0
                 ORDER BY created_at ASC, id ASC",
            )?;
            let messages = stmt
                .query_map(params![user_id], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await?
    }

    /// Two-party conversation history, newest first, paginated.
    pub async fn history(
        &self,
        user_id: UserId,
        peer_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, created_at, delivered
                 FROM chats
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3 OFFSET ?4",
            )?;
            let messages = stmt
                .query_map(params![user_id, peer_id, limit, offset], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await?
    }

    /// Undelivered message counts for a user, grouped by sender.
    pub async fn unread_counts(
        &self,
        user_id: UserId,
    ) -> Result<HashMap<UserId, i64>, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            let mut stmt = conn.prepare(
                "SELECT sender_id, COUNT(*)
                 FROM chats
                 WHERE receiver_id = ?1 AND delivered = 0
                 GROUP BY sender_id",
            )?;
            let counts = stmt
                .query_map(params![user_id], |row| {
                    Ok((row.get::<_, UserId>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<HashMap<_, _>, _>>()?;
            Ok(counts)
        })
        .await?
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        delivered: row.get::<_, i64>(5)? != 0,
    })
}
