use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::traits::ConversationStore;
use flowstudio_core::types::{MemoryMessage, Role};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        conversation_id TEXT NOT NULL,
        role TEXT NOT NULL,
        role_type TEXT,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, seq);";

/// SQLite-backed conversation memory.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| FlowError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Conversation store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored messages for a conversation.
    pub fn count(&self, conversation_id: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(n as usize)
    }
}

impl ConversationStore for SqliteStore {
    fn append(&self, conversation_id: &str, message: MemoryMessage) -> BoxFuture<'_, Result<()>> {
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, role_type, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    conversation_id,
                    message.role.as_str(),
                    message.role_type,
                    message.content,
                    message.timestamp.to_rfc3339(),
                ],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn load(&self, conversation_id: &str) -> BoxFuture<'_, Result<Vec<MemoryMessage>>> {
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, role, role_type, content, timestamp FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY seq ASC",
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let rows = stmt
                .query_map(params![conversation_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let mut messages = Vec::new();
            for row in rows {
                let (id, role, role_type, content, ts_str) =
                    row.map_err(|e| FlowError::Database(e.to_string()))?;
                let timestamp = DateTime::parse_from_rfc3339(&ts_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                messages.push(MemoryMessage {
                    id,
                    role: Role::parse(&role),
                    content,
                    role_type,
                    timestamp,
                });
            }

            Ok(messages)
        })
    }
}
