use crate::{
    chat::{ChatMessage, ChatSession, NewMessage, SessionSummary},
    entity::Sender,
};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Session and message persistence backed by SQLite.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database. A single long-lived connection keeps it alive.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES chat_sessions(id),
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                external_chat_id INTEGER,
                external_message_id INTEGER,
                created_at DATETIME NOT NULL,
                UNIQUE (external_chat_id, external_message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert the session unless it already exists.
    ///
    /// Returns the stored session and whether this call created it.
    pub async fn ensure_session(&self, session_id: &str) -> StoreResult<(ChatSession, bool)> {
        let candidate = ChatSession::new(session_id);

        let result = sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, created_at)
            VALUES (?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&candidate.id)
        .bind(candidate.created_at)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        let session = match self.get_session(session_id).await? {
            Some(session) => session,
            None => {
                return Err(StoreError::Corrupt(format!(
                    "session {session_id} missing after upsert"
                )))
            }
        };

        Ok((session, created))
    }

    pub async fn get_session(&self, session_id: &str) -> StoreResult<Option<ChatSession>> {
        let row = sqlx::query("SELECT id, created_at FROM chat_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ChatSession {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    /// Append a message to its session's log.
    pub async fn append_message(&self, msg: &NewMessage) -> StoreResult<ChatMessage> {
        let created_at = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO chat_messages (session_id, sender, content, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&msg.session_id)
        .bind(msg.sender.as_str())
        .bind(&msg.content)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(ChatMessage {
            id: result.last_insert_rowid(),
            session_id: msg.session_id.clone(),
            sender: msg.sender,
            content: msg.content.clone(),
            external_chat_id: None,
            external_message_id: None,
            created_at,
        })
    }

    /// Attach the Telegram chat and message id of the notification to a
    /// relayed message.
    ///
    /// Only succeeds once per message; returns `false` if the message does not
    /// exist or was already stamped. The pair is unique across the store.
    pub async fn set_external_message_id(
        &self,
        message_id: i64,
        external_chat_id: i64,
        external_message_id: i64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chat_messages
            SET external_chat_id = ?, external_message_id = ?
            WHERE id = ? AND external_message_id IS NULL
            "#,
        )
        .bind(external_chat_id)
        .bind(external_message_id)
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Resolve the session a relayed message belongs to.
    pub async fn find_session_by_external_id(
        &self,
        external_chat_id: i64,
        external_message_id: i64,
    ) -> StoreResult<Option<String>> {
        let session_id = sqlx::query_scalar::<_, String>(
            r#"
            SELECT session_id FROM chat_messages
            WHERE external_chat_id = ? AND external_message_id = ?
            "#,
        )
        .bind(external_chat_id)
        .bind(external_message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session_id)
    }

    /// Full history for a session, oldest first.
    pub async fn get_chat_history(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, sender, content,
                   external_chat_id, external_message_id, created_at
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Sessions with their latest message, most recently active first.
    pub async fn list_sessions(&self, limit: i64) -> StoreResult<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.created_at,
                   m.content AS last_message_content,
                   m.created_at AS last_message_at
            FROM chat_sessions s
            LEFT JOIN chat_messages m
                ON m.id = (SELECT MAX(id) FROM chat_messages WHERE session_id = s.id)
            ORDER BY m.id IS NULL, m.id DESC, s.created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(SessionSummary {
                id: row.try_get("id")?,
                created_at: row.try_get("created_at")?,
                last_message_content: row.try_get("last_message_content")?,
                last_message_at: row.try_get("last_message_at")?,
            });
        }

        Ok(sessions)
    }
}

fn message_from_row(row: &SqliteRow) -> StoreResult<ChatMessage> {
    let sender: String = row.try_get("sender")?;
    let sender = sender.parse::<Sender>().map_err(StoreError::Corrupt)?;

    Ok(ChatMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        sender,
        content: row.try_get("content")?,
        external_chat_id: row.try_get("external_chat_id")?,
        external_message_id: row.try_get("external_message_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    let store = Store::in_memory().await.unwrap();
    store.init().await.unwrap();
    store
}
