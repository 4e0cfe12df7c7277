//! SQLite-backed message store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::{HistoryQuery, MessageStore};
use crate::error::{RelayError, Result};
use crate::protocol::ChatMessage;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    -- Conversation pair, user_id_1 < user_id_2
    user_id_1 TEXT NOT NULL,
    user_id_2 TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    -- RFC 3339, UTC, microsecond precision (sorts lexicographically)
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_time
    ON messages (user_id_1, user_id_2, created_at);
"#;

/// Message store over a single SQLite connection.
#[derive(Clone)]
pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMessageStore {
    /// Open or create a database file.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| RelayError::Store(format!("Failed to open database: {}", e)))?;
        Self::init(conn)
    }

    /// In-memory database, gone when the store is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RelayError::Store(format!("Failed to create in-memory database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| RelayError::Store(format!("Failed to create tables: {}", e)))?;
        tracing::info!("Message store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking database closure off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&*guard)
        })
        .await
        .map_err(|e| RelayError::Store(format!("Database task failed: {}", e)))?
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let created_at: String = row.get(4)?;
    Ok(ChatMessage {
        user_id_1: row.get(0)?,
        user_id_2: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn persist(&self, message: &ChatMessage) -> Result<()> {
        let message = message.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (user_id_1, user_id_2, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.user_id_1,
                    message.user_id_2,
                    message.sender_id,
                    message.content,
                    format_time(&message.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<ChatMessage>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let messages = match query.since {
                Some(since) => {
                    let mut stmt = conn.prepare(
                        "SELECT user_id_1, user_id_2, sender_id, content, created_at
                         FROM messages
                         WHERE user_id_1 = ?1 AND user_id_2 = ?2 AND created_at > ?3
                         ORDER BY created_at ASC, id ASC
                         LIMIT ?4",
                    )?;
                    let rows = stmt.query_map(
                        params![
                            query.user_id_1,
                            query.user_id_2,
                            format_time(&since),
                            query.limit as i64
                        ],
                        row_to_message,
                    )?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT user_id_1, user_id_2, sender_id, content, created_at
                         FROM messages
                         WHERE user_id_1 = ?1 AND user_id_2 = ?2
                         ORDER BY created_at ASC, id ASC
                         LIMIT ?3 OFFSET ?4",
                    )?;
                    let rows = stmt.query_map(
                        params![
                            query.user_id_1,
                            query.user_id_2,
                            query.limit as i64,
                            query.offset as i64
                        ],
                        row_to_message,
                    )?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(messages)
        })
        .await
    }
}
