use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: chat message log

CREATE TABLE chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id INTEGER NOT NULL,
    receiver_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0
);

-- Undelivered replay scans by receiver
CREATE INDEX idx_chats_receiver_delivered ON chats(receiver_id, delivered);

-- Two-party history scans
CREATE INDEX idx_chats_sender_receiver ON chats(sender_id, receiver_id);
",
    )])
}
