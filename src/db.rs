//! Conversation store
//!
//! Owns users, the canonical pairing of two identities into one chat, and the
//! append-only message log per chat. Pure data and invariants; no transport
//! concerns.

mod schema;

pub use schema::*;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Name is required")]
    NameRequired,
    #[error("Email already registered")]
    EmailExists,
    #[error("User does not exist")]
    UserNotFound,
    #[error("Chat not found")]
    ChatNotFound,
    #[error("Cannot start a chat with yourself")]
    SelfChat,
    #[error("You are not part of this chat")]
    NotAParticipant,
    #[error("Message cannot be empty")]
    EmptyMessage,
}

pub type DbResult<T> = Result<T, DbError>;

const MESSAGE_SELECT: &str = "SELECT m.id, m.chat_id, m.sender_id, m.recipient_id, u.name, m.content, m.created_at, u.avatar_url
     FROM messages m LEFT JOIN users u ON u.id = m.sender_id";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== User Operations ====================

    /// Create a new account. The email is normalized to lowercase and must be
    /// unique; the password is stored as a SHA-256 hex digest.
    pub fn create_user(&self, name: &str, email: &str, password: &str) -> DbResult<UserProfile> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DbError::NameRequired);
        }
        let email = email.trim().to_lowercase();

        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1)",
            params![email],
            |row| row.get(0),
        )?;
        if exists {
            return Err(DbError::EmailExists);
        }

        let id = Uuid::new_v4();
        let abbreviation = abbreviation_from(name);
        conn.execute(
            "INSERT INTO users (id, name, email, password_hash, avatar_url, abbreviation, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
            params![
                id.to_string(),
                name,
                email,
                crate::auth::hash_password(password),
                abbreviation,
                Utc::now().timestamp_millis(),
            ],
        )?;

        Ok(UserProfile {
            id,
            name: name.to_string(),
            email,
            avatar_url: None,
            abbreviation,
        })
    }

    /// Look up an account by credentials. `None` on unknown email or wrong
    /// password.
    pub fn authenticate(&self, email: &str, password: &str) -> DbResult<Option<UserProfile>> {
        let email = email.trim().to_lowercase();
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, UserProfile)> = conn
            .query_row(
                "SELECT password_hash, id, name, email, avatar_url, abbreviation
                 FROM users WHERE email = ?1",
                params![email],
                |row| {
                    Ok((
                        row.get(0)?,
                        UserProfile {
                            id: parse_uuid(&row.get::<_, String>(1)?),
                            name: row.get(2)?,
                            email: row.get(3)?,
                            avatar_url: row.get(4)?,
                            abbreviation: row.get(5)?,
                        },
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(|(hash, profile)| {
            (hash == crate::auth::hash_password(password)).then_some(profile)
        }))
    }

    /// Get a user profile by id
    pub fn get_user(&self, id: Uuid) -> DbResult<Option<UserProfile>> {
        let conn = self.conn.lock().unwrap();
        Self::user_profile(&conn, id)
    }

    /// Search users by name or email substring, excluding the caller.
    /// Blank terms match nothing.
    pub fn search_users(&self, current_user: Uuid, term: &str) -> DbResult<Vec<UserPreview>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{term}%");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, abbreviation, avatar_url, email FROM users
             WHERE (name LIKE ?1 OR email LIKE ?1) AND id != ?2
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![pattern, current_user.to_string()], |row| {
            Ok(UserPreview {
                id: parse_uuid(&row.get::<_, String>(0)?),
                name: row.get(1)?,
                abbreviation: row.get(2)?,
                avatar_url: row.get(3)?,
                email: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Chat Operations ====================

    /// Return the canonical chat for the unordered pair `{a, b}`, creating it
    /// if absent. Requires `a != b` and both users to exist.
    ///
    /// Safe under concurrent callers racing to create the same pair: the
    /// unique index over the canonically-ordered pair lets exactly one insert
    /// commit; the loser re-reads and returns the winner's row.
    pub fn ensure_chat(&self, a: Uuid, b: Uuid) -> DbResult<ChatRecord> {
        if a == b {
            return Err(DbError::SelfChat);
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };

        let conn = self.conn.lock().unwrap();
        if let Some(existing) = Self::chat_by_pair(&conn, lo, hi)? {
            return Ok(existing);
        }
        if !Self::user_exists(&conn, lo)? || !Self::user_exists(&conn, hi)? {
            return Err(DbError::UserNotFound);
        }

        let id = Uuid::new_v4();
        let inserted = conn.execute(
            "INSERT INTO chats (id, user_a, user_b, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                lo.to_string(),
                hi.to_string(),
                Utc::now().timestamp_millis(),
            ],
        );
        match inserted {
            Ok(_) => Ok(ChatRecord {
                id,
                user_a: lo,
                user_b: hi,
            }),
            // Lost the create race: another caller committed the pair first.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::chat_by_pair(&conn, lo, hi)?.ok_or(DbError::ChatNotFound)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// List every chat containing the given identity, each with the other
    /// participant's preview and the most recent message (or none).
    pub fn list_chats(&self, for_user: Uuid) -> DbResult<Vec<ChatSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_a, user_b FROM chats WHERE user_a = ?1 OR user_b = ?1",
        )?;
        let chats = stmt
            .query_map(params![for_user.to_string()], map_chat_row)?
            .collect::<Result<Vec<_>, _>>()?;

        chats
            .into_iter()
            .map(|chat| Self::summary(&conn, &chat, for_user))
            .collect()
    }

    /// Build the participant-facing summary of one chat
    pub fn chat_summary(&self, chat: &ChatRecord, for_user: Uuid) -> DbResult<ChatSummary> {
        let conn = self.conn.lock().unwrap();
        Self::summary(&conn, chat, for_user)
    }

    // ==================== Message Operations ====================

    /// Append a message to a chat. The sender must be a member and the body
    /// must be non-empty after trimming. The timestamp is assigned here, never
    /// client-supplied, and is clamped so it never decreases within a chat.
    pub fn add_message(&self, chat_id: Uuid, sender: Uuid, content: &str) -> DbResult<MessagePayload> {
        let conn = self.conn.lock().unwrap();
        let chat = Self::chat_by_id(&conn, chat_id)?.ok_or(DbError::ChatNotFound)?;
        if !chat.is_member(sender) {
            return Err(DbError::NotAParticipant);
        }
        let body = content.trim();
        if body.is_empty() {
            return Err(DbError::EmptyMessage);
        }
        let recipient = chat.other_member(sender);

        let (seq, ts_floor): (i64, i64) = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1, COALESCE(MAX(created_at), 0)
             FROM messages WHERE chat_id = ?1",
            params![chat.id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let timestamp = Utc::now().timestamp_millis().max(ts_floor);

        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO messages (id, chat_id, sender_id, recipient_id, content, seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                chat.id.to_string(),
                sender.to_string(),
                recipient.to_string(),
                body,
                seq,
                timestamp,
            ],
        )?;

        Self::message_by_id(&conn, id)?.ok_or(DbError::ChatNotFound)
    }

    /// All messages of a chat in persistence order. The requester must be a
    /// member.
    pub fn get_messages(&self, chat_id: Uuid, requester: Uuid) -> DbResult<Vec<MessagePayload>> {
        let conn = self.conn.lock().unwrap();
        let chat = Self::chat_by_id(&conn, chat_id)?.ok_or(DbError::ChatNotFound)?;
        if !chat.is_member(requester) {
            return Err(DbError::NotAParticipant);
        }

        let mut stmt =
            conn.prepare(&format!("{MESSAGE_SELECT} WHERE m.chat_id = ?1 ORDER BY m.seq ASC"))?;
        let rows = stmt.query_map(params![chat.id.to_string()], map_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Internal helpers ====================

    fn user_exists(conn: &Connection, id: Uuid) -> DbResult<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn user_profile(conn: &Connection, id: Uuid) -> DbResult<Option<UserProfile>> {
        conn.query_row(
            "SELECT id, name, email, avatar_url, abbreviation FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(UserProfile {
                    id: parse_uuid(&row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    email: row.get(2)?,
                    avatar_url: row.get(3)?,
                    abbreviation: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }

    fn user_preview(conn: &Connection, id: Uuid) -> DbResult<Option<UserPreview>> {
        conn.query_row(
            "SELECT id, name, abbreviation, avatar_url, email FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(UserPreview {
                    id: parse_uuid(&row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    abbreviation: row.get(2)?,
                    avatar_url: row.get(3)?,
                    email: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }

    fn chat_by_pair(conn: &Connection, lo: Uuid, hi: Uuid) -> DbResult<Option<ChatRecord>> {
        conn.query_row(
            "SELECT id, user_a, user_b FROM chats WHERE user_a = ?1 AND user_b = ?2",
            params![lo.to_string(), hi.to_string()],
            map_chat_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    fn chat_by_id(conn: &Connection, id: Uuid) -> DbResult<Option<ChatRecord>> {
        conn.query_row(
            "SELECT id, user_a, user_b FROM chats WHERE id = ?1",
            params![id.to_string()],
            map_chat_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    fn message_by_id(conn: &Connection, id: Uuid) -> DbResult<Option<MessagePayload>> {
        conn.query_row(
            &format!("{MESSAGE_SELECT} WHERE m.id = ?1"),
            params![id.to_string()],
            map_message_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    fn last_message(conn: &Connection, chat_id: Uuid) -> DbResult<Option<MessagePayload>> {
        conn.query_row(
            &format!("{MESSAGE_SELECT} WHERE m.chat_id = ?1 ORDER BY m.seq DESC LIMIT 1"),
            params![chat_id.to_string()],
            map_message_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    fn summary(conn: &Connection, chat: &ChatRecord, for_user: Uuid) -> DbResult<ChatSummary> {
        let contact_id = chat.other_member(for_user);
        let contact = Self::user_preview(conn, contact_id)?.unwrap_or(UserPreview {
            id: contact_id,
            name: "Unknown".to_string(),
            abbreviation: "UN".to_string(),
            avatar_url: None,
            email: None,
        });
        Ok(ChatSummary {
            chat_id: chat.id,
            contact,
            last_message: Self::last_message(conn, chat.id)?,
        })
    }
}

fn map_chat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: parse_uuid(&row.get::<_, String>(0)?),
        user_a: parse_uuid(&row.get::<_, String>(1)?),
        user_b: parse_uuid(&row.get::<_, String>(2)?),
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessagePayload> {
    Ok(MessagePayload {
        id: parse_uuid(&row.get::<_, String>(0)?),
        chat_id: parse_uuid(&row.get::<_, String>(1)?),
        sender_id: parse_uuid(&row.get::<_, String>(2)?),
        recipient_id: parse_uuid(&row.get::<_, String>(3)?),
        sender_name: row
            .get::<_, Option<String>>(4)?
            .unwrap_or_else(|| "Unknown".to_string()),
        content: row.get(5)?,
        timestamp: row.get(6)?,
        sender_avatar_url: row.get(7)?,
    })
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_default()
}

/// Two-letter tag derived from the account name, shown where no avatar is set
fn abbreviation_from(name: &str) -> String {
    let mut words = name.split_whitespace();
    let first_word = words.next();
    let second_word = words.next();

    let upper = |c: char| c.to_uppercase().next().unwrap_or(c);
    let first = first_word.and_then(|w| w.chars().next()).map_or('X', upper);
    let second = second_word
        .and_then(|w| w.chars().next())
        .or_else(|| first_word.and_then(|w| w.chars().nth(1)))
        .map_or('Y', upper);
    format!("{first}{second}")
}
