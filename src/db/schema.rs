//! Database schema and wire-facing record types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// SQL schema for initialization
///
/// The chat pair is stored in canonical order (`user_a < user_b`), so the
/// unique index makes the pair itself unique regardless of which side
/// initiated the chat. A create race commits exactly one row; the loser
/// re-reads the winner's.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    avatar_url TEXT,
    abbreviation TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    user_a TEXT NOT NULL,
    user_b TEXT NOT NULL,
    created_at INTEGER NOT NULL,

    UNIQUE (user_a, user_b),
    FOREIGN KEY (user_a) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (user_b) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chats_user_a ON chats(user_a);
CREATE INDEX IF NOT EXISTS idx_chats_user_b ON chats(user_b);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    content TEXT NOT NULL,
    seq INTEGER NOT NULL,
    created_at INTEGER NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, seq);
"#;

/// Full account record exposed to the account's owner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub abbreviation: String,
}

/// Reduced account record shown to other users (search results, chat list)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreview {
    pub id: Uuid,
    pub name: String,
    pub abbreviation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Chat row: the canonical channel between two distinct identities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: Uuid,
    pub user_a: Uuid,
    pub user_b: Uuid,
}

impl ChatRecord {
    pub fn is_member(&self, user: Uuid) -> bool {
        self.user_a == user || self.user_b == user
    }

    /// The other participant. Callers must check membership first.
    pub fn other_member(&self, user: Uuid) -> Uuid {
        if self.user_a == user {
            self.user_b
        } else {
            self.user_a
        }
    }
}

/// One chat as listed for a participant: the other side plus the latest
/// message, if any
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: Uuid,
    pub contact: UserPreview,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
}

/// Fully-resolved message as delivered to clients
///
/// Sender name and avatar are re-read from the users table every time the
/// message is materialized, so renames show up on the next message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_avatar_url: Option<String>,
}
