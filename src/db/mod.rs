pub mod models;

use crate::ids;
use chrono::{SecondsFormat, Utc};
use models::{
    title_from_message, ContextEntry, Conversation, ConversationSummary, Message, Role,
    NEW_CHAT_TITLE,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database lock poisoned")]
    Poisoned,
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(app_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(app_dir)?;
        let conn = Connection::open(app_dir.join("ai-companion.db"))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_seq INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                images TEXT,
                image_descriptions TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, seq);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Conversations ──

    /// Appends one message, creating the conversation on first use.
    ///
    /// Runs as a single transaction: the conversation row, the message row and
    /// the timestamp touch either all land or none do.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        images: &[String],
        image_descriptions: &[String],
    ) -> Result<Message, StoreError> {
        if !images.is_empty()
            && !image_descriptions.is_empty()
            && images.len() != image_descriptions.len()
        {
            return Err(StoreError::Invariant(format!(
                "{} images but {} descriptions",
                images.len(),
                image_descriptions.len()
            )));
        }
        let images = (!images.is_empty()).then(|| images.to_vec());
        let image_descriptions =
            (!image_descriptions.is_empty()).then(|| image_descriptions.to_vec());
        let images_json = images.as_ref().map(|v| serde_json::to_string(v)).transpose()?;
        let descriptions_json = image_descriptions
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()?;

        let id = ids::message_id();
        let now = now_timestamp();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing_title: Option<String> = tx
            .query_row(
                "SELECT title FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        match existing_title {
            None => {
                let title = match role {
                    Role::User => title_from_message(content),
                    Role::Bot => NEW_CHAT_TITLE.to_string(),
                };
                tx.execute(
                    "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                    params![conversation_id, title, now],
                )?;
            }
            Some(title) if role == Role::User && title == NEW_CHAT_TITLE => {
                tx.execute(
                    "UPDATE conversations SET title = ?1 WHERE id = ?2",
                    params![title_from_message(content), conversation_id],
                )?;
            }
            Some(_) => {}
        }
        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, images, image_descriptions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                conversation_id,
                role.as_str(),
                content,
                images_json,
                descriptions_json,
                now
            ],
        )?;
        let seq = tx.last_insert_rowid();
        // Touch conversation updated_at and recency
        tx.execute(
            "UPDATE conversations SET updated_at = ?1, last_seq = ?2 WHERE id = ?3",
            params![now, seq, conversation_id],
        )?;
        tx.commit()?;

        debug!(chat_id = conversation_id, role = role.as_str(), "message appended");
        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            images,
            image_descriptions,
            created_at: now,
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.lock()?;
        let header = conn
            .query_row(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                        messages: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut conversation) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, images, image_descriptions, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![id], message_from_row)?;
        for row in rows {
            if let Some(message) = row? {
                conversation.messages.push(message);
            }
        }
        Ok(Some(conversation))
    }

    /// The `max_count` most recent messages, oldest first. Unknown ids yield
    /// an empty window.
    pub fn recent_window(
        &self,
        conversation_id: &str,
        max_count: usize,
    ) -> Result<Vec<ContextEntry>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, role, content, image_descriptions FROM messages
             WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(max_count).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![conversation_id, limit], |row| {
            let message_id: String = row.get(0)?;
            let raw_role: String = row.get(1)?;
            let content: String = row.get(2)?;
            let image_descriptions = decode_list(&message_id, row.get(3)?).unwrap_or_default();
            Ok(Role::parse(&raw_role).map(|role| ContextEntry {
                message_id,
                role,
                content,
                image_descriptions,
            }))
        })?;
        let mut window = Vec::new();
        for row in rows {
            if let Some(entry) = row? {
                window.push(entry);
            }
        }
        window.reverse();
        Ok(window)
    }

    /// All conversations, most recently updated first.
    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, updated_at FROM conversations ORDER BY last_seq DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ConversationSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Case-insensitive substring match against titles only.
    pub fn search_conversations(&self, query: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let needle = query.trim().to_lowercase();
        let all = self.list_conversations()?;
        Ok(all
            .into_iter()
            .filter(|c| c.title.to_lowercase().contains(&needle))
            .collect())
    }

    pub fn conversation_exists(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fresh conversation id that is not yet in the store.
    pub fn new_conversation_id(&self) -> String {
        ids::conversation_id(|id| match self.conversation_exists(id) {
            Ok(exists) => exists,
            Err(e) => {
                warn!(chat_id = %id, error = %e, "could not check conversation id, assuming unused");
                false
            }
        })
    }

    /// Deletes one conversation and returns the image files its messages
    /// referenced.
    pub fn delete_conversation(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let images = {
            let mut stmt =
                tx.prepare("SELECT images FROM messages WHERE conversation_id = ?1")?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, Option<String>>(0))?;
            collect_images(rows)?
        };
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(images)
    }

    /// Deletes every conversation and returns all referenced image files.
    pub fn clear_all(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let images = {
            let mut stmt = tx.prepare("SELECT images FROM messages")?;
            let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;
            collect_images(rows)?
        };
        tx.execute("DELETE FROM messages", [])?;
        tx.execute("DELETE FROM conversations", [])?;
        tx.commit()?;
        Ok(images)
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Rows with an unknown role are treated as absent; unparseable image columns
/// read as `None`.
fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Option<Message>> {
    let id: String = row.get(0)?;
    let raw_role: String = row.get(2)?;
    let Some(role) = Role::parse(&raw_role) else {
        warn!(message_id = %id, role = %raw_role, "skipping stored message with unknown role");
        return Ok(None);
    };
    let images = decode_list(&id, row.get(4)?);
    let mut image_descriptions = decode_list(&id, row.get(5)?);
    if let (Some(images), Some(descriptions)) = (&images, &image_descriptions) {
        if images.len() != descriptions.len() {
            warn!(message_id = %id, "image descriptions do not line up with images, ignoring them");
            image_descriptions = None;
        }
    }
    Ok(Some(Message {
        id,
        conversation_id: row.get(1)?,
        role,
        content: row.get(3)?,
        images,
        image_descriptions,
        created_at: row.get(6)?,
    }))
}

fn decode_list(message_id: &str, raw: Option<String>) -> Option<Vec<String>> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(list) => Some(list),
        Err(e) => {
            warn!(message_id, error = %e, "unreadable image list in stored message");
            None
        }
    }
}

fn collect_images(
    rows: impl Iterator<Item = rusqlite::Result<Option<String>>>,
) -> Result<Vec<String>, StoreError> {
    let mut images = Vec::new();
    for raw in rows {
        if let Some(list) = raw?.and_then(|r| serde_json::from_str::<Vec<String>>(&r).ok()) {
            images.extend(list);
        }
    }
    Ok(images)
}
