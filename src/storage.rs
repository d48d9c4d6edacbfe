use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::models::{Conversation, MediaType, Message, Role};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("storage error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("conversation {0} not found")]
  ConversationNotFound(String),
  #[error("corrupt row: {0}")]
  Corrupt(String),
}

/// The persistence surface the session needs.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
  async fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation, StoreError>;
  async fn save_message(&self, conversation_id: &str, message: &Message) -> Result<(), StoreError>;
  /// Oldest first.
  async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;
  /// Most recently updated first.
  async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError>;
}

pub fn init_db(path: &Path) -> anyhow::Result<Connection> {
  let conn = Connection::open(path)?;
  create_schema(&conn)?;
  Ok(conn)
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
  conn.execute_batch(
    "
    CREATE TABLE IF NOT EXISTS conversations (
      id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      title TEXT NOT NULL,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS conversations_user_updated
      ON conversations (user_id, updated_at);
    CREATE TABLE IF NOT EXISTS messages (
      id TEXT PRIMARY KEY,
      conversation_id TEXT NOT NULL REFERENCES conversations(id),
      role TEXT NOT NULL,
      content TEXT NOT NULL,
      media_url TEXT,
      media_type TEXT,
      created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS messages_conversation_created
      ON messages (conversation_id, created_at);
    ",
  )
}

fn now() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct SqliteStore {
  db: Mutex<Connection>,
}

impl SqliteStore {
  pub fn new(conn: Connection) -> Self {
    Self { db: Mutex::new(conn) }
  }

  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()?;
    create_schema(&conn)?;
    Ok(Self::new(conn))
  }
}

#[async_trait::async_trait]
impl ConversationStore for SqliteStore {
  async fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let created_at = now();
    let conn = self.db.lock().await;
    conn.execute(
      "INSERT INTO conversations (id, user_id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
      params![id, user_id, title, created_at],
    )?;
    Ok(Conversation {
      id,
      user_id: user_id.to_string(),
      title: title.to_string(),
      created_at: created_at.clone(),
      updated_at: created_at,
    })
  }

  async fn save_message(&self, conversation_id: &str, message: &Message) -> Result<(), StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let created_at = now();
    let mut conn = self.db.lock().await;
    let tx = conn.transaction()?;
    let updated = tx.execute(
      "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
      params![conversation_id, created_at],
    )?;
    if updated == 0 {
      return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
    }
    tx.execute(
      "INSERT INTO messages (id, conversation_id, role, content, media_url, media_type, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        id,
        conversation_id,
        message.role.as_str(),
        message.content,
        message.media_url,
        message.media_type.map(|m| m.as_str()),
        created_at
      ],
    )?;
    tx.commit()?;
    Ok(())
  }

  async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
    let conn = self.db.lock().await;
    let exists = conn
      .query_row(
        "SELECT 1 FROM conversations WHERE id = ?1",
        params![conversation_id],
        |_| Ok(()),
      )
      .optional()?;
    if exists.is_none() {
      return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
    }

    let mut stmt = conn.prepare(
      "SELECT role, content, media_url, media_type FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, Option<String>>(2)?,
        row.get::<_, Option<String>>(3)?,
      ))
    })?;

    let mut messages = Vec::new();
    for row in rows {
      let (role, content, media_url, media_type) = row?;
      let role = Role::parse(&role).ok_or_else(|| StoreError::Corrupt(format!("unknown role {role}")))?;
      let media_type = match media_type {
        Some(value) => Some(
          MediaType::parse(&value).ok_or_else(|| StoreError::Corrupt(format!("unknown media type {value}")))?,
        ),
        None => None,
      };
      messages.push(Message {
        role,
        content,
        media_url,
        media_type,
      });
    }
    Ok(messages)
  }

  async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
    let conn = self.db.lock().await;
    let mut stmt = conn.prepare(
      "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE user_id = ?1 ORDER BY updated_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map(params![user_id], |row| {
      Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
      })
    })?;
    let conversations = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(conversations)
  }
}
