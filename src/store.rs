use crate::chat::{AttachmentRef, ChatMessage, ChatSession, NewMessage};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    },
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr, time::Duration};

const SESSION_COLUMNS: &str = "id, title, status, customer_id, admin_id, last_message_at, \
     created_at, closed_at, closed_by, revision";

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, sender_role, body, kind, \
     attachment_path, attachment_name, attachment_size, attachment_mime, is_read, created_at";

/// Which sessions a list query returns. `None` fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub customer_id: Option<String>,
    pub admin_id: Option<String>,
}

/// Result of trying to append a message inside one transaction.
#[derive(Debug)]
pub enum AppendOutcome {
    Appended(ChatMessage),
    /// The session stopped being open before the implicit claim ran.
    ClaimLost,
    /// The session is closed or gone.
    NotWritable,
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database, already initialised.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // Every connection to :memory: is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('open', 'assigned', 'closed')),
                customer_id TEXT NOT NULL,
                admin_id TEXT,
                last_message_at DATETIME NOT NULL,
                created_at DATETIME NOT NULL,
                closed_at DATETIME,
                closed_by TEXT,
                revision INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_chat_sessions_last_message ON chat_sessions(last_message_at DESC);
            CREATE INDEX IF NOT EXISTS idx_chat_sessions_customer ON chat_sessions(customer_id);
            CREATE INDEX IF NOT EXISTS idx_chat_sessions_admin ON chat_sessions(admin_id);

            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL,
                sender_role TEXT NOT NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('text', 'image', 'file')),
                attachment_path TEXT,
                attachment_name TEXT,
                attachment_size INTEGER,
                attachment_mime TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                CHECK ((kind = 'text') = (attachment_path IS NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_chat_created ON chat_messages(chat_id, created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Insert a session and its first message in one transaction.
    pub async fn create_session(
        &self,
        session: &ChatSession,
        first: NewMessage,
    ) -> Result<ChatMessage> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chat_sessions
                (id, title, status, customer_id, admin_id, last_message_at, created_at, revision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(session.status.as_str())
        .bind(&session.customer_id)
        .bind(&session.admin_id)
        .bind(session.last_message_at)
        .bind(session.created_at)
        .bind(session.revision)
        .execute(&mut *tx)
        .await
        .context("Failed to insert chat session")?;

        let id = insert_message(&mut tx, &first).await?;
        tx.commit().await.context("Failed to commit new chat")?;

        Ok(first.into_message(id))
    }

    pub async fn get_session(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        let sql = format!("SELECT {} FROM chat_sessions WHERE id = ?", SESSION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch chat session")?;

        row.as_ref().map(session_from_row).transpose()
    }

    /// Sessions matching `filter`, most recently active first.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ChatSession>> {
        let sql = format!(
            "SELECT {} FROM chat_sessions \
             WHERE (?1 IS NULL OR customer_id = ?1) AND (?2 IS NULL OR admin_id = ?2) \
             ORDER BY last_message_at DESC, id ASC",
            SESSION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&filter.customer_id)
            .bind(&filter.admin_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list chat sessions")?;

        rows.iter().map(session_from_row).collect()
    }

    /// Messages of a chat in insertion order (oldest first).
    pub async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let sql = format!(
            "SELECT {} FROM chat_messages WHERE chat_id = ? ORDER BY id ASC",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch chat messages")?;

        rows.iter().map(message_from_row).collect()
    }

    /// Compare-and-set open -> assigned. Returns false if the session was not open.
    pub async fn claim(&self, chat_id: &str, admin_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET status = 'assigned', admin_id = ?, revision = revision + 1
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(admin_id)
        .bind(chat_id)
        .execute(&self.pool)
        .await
        .context("Failed to claim chat session")?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert a message, optionally claiming the session for `claim_for` first.
    /// The claim, the `last_message_at` bump and the insert commit together.
    pub async fn append_message(
        &self,
        msg: NewMessage,
        claim_for: Option<&str>,
    ) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(admin_id) = claim_for {
            let claimed = sqlx::query(
                r#"
                UPDATE chat_sessions
                SET status = 'assigned', admin_id = ?, revision = revision + 1
                WHERE id = ? AND status = 'open'
                "#,
            )
            .bind(admin_id)
            .bind(&msg.chat_id)
            .execute(&mut *tx)
            .await
            .context("Failed to claim chat session")?;

            if claimed.rows_affected() == 0 {
                return Ok(AppendOutcome::ClaimLost);
            }
        }

        let touched = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET last_message_at = ?, revision = revision + 1
            WHERE id = ? AND status != 'closed'
            "#,
        )
        .bind(msg.created_at)
        .bind(&msg.chat_id)
        .execute(&mut *tx)
        .await
        .context("Failed to touch chat session")?;

        if touched.rows_affected() == 0 {
            return Ok(AppendOutcome::NotWritable);
        }

        let id = insert_message(&mut tx, &msg).await?;
        tx.commit().await.context("Failed to commit message")?;

        Ok(AppendOutcome::Appended(msg.into_message(id)))
    }

    /// Returns false if the session was already closed (or missing).
    pub async fn close(&self, chat_id: &str, closed_by: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET status = 'closed', closed_at = ?, closed_by = ?, revision = revision + 1
            WHERE id = ? AND status != 'closed'
            "#,
        )
        .bind(at)
        .bind(closed_by)
        .bind(chat_id)
        .execute(&self.pool)
        .await
        .context("Failed to close chat session")?;

        Ok(result.rows_affected() == 1)
    }

    /// Hard-delete a session and its messages. Returns false if nothing was deleted.
    pub async fn delete(&self, chat_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chat_messages WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete chat messages")?;

        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete chat session")?;

        tx.commit().await.context("Failed to commit chat deletion")?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark everything the other party sent as read. Returns how many rows flipped.
    pub async fn mark_read(&self, chat_id: &str, reader_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE chat_messages
            SET is_read = 1
            WHERE chat_id = ? AND sender_id != ? AND is_read = 0
            "#,
        )
        .bind(chat_id)
        .bind(reader_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark messages read")?;

        Ok(result.rows_affected())
    }
}

async fn insert_message(conn: &mut SqliteConnection, msg: &NewMessage) -> Result<i64> {
    let attachment = msg.attachment.as_ref();
    let result = sqlx::query(
        r#"
        INSERT INTO chat_messages
            (chat_id, sender_id, sender_role, body, kind,
             attachment_path, attachment_name, attachment_size, attachment_mime, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&msg.chat_id)
    .bind(&msg.sender_id)
    .bind(msg.sender_role.as_str())
    .bind(&msg.body)
    .bind(msg.kind.as_str())
    .bind(attachment.map(|a| a.path.as_str()))
    .bind(attachment.map(|a| a.name.as_str()))
    .bind(attachment.map(|a| a.size as i64))
    .bind(attachment.map(|a| a.mime.as_str()))
    .bind(msg.created_at)
    .execute(&mut *conn)
    .await
    .context("Failed to save message")?;

    Ok(result.last_insert_rowid())
}

fn session_from_row(row: &SqliteRow) -> Result<ChatSession> {
    let status: String = row.try_get("status")?;

    Ok(ChatSession {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        status: status.parse()?,
        customer_id: row.try_get("customer_id")?,
        admin_id: row.try_get("admin_id")?,
        last_message_at: row.try_get("last_message_at")?,
        created_at: row.try_get("created_at")?,
        closed_at: row.try_get("closed_at")?,
        closed_by: row.try_get("closed_by")?,
        revision: row.try_get("revision")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.try_get("sender_role")?;
    let kind: String = row.try_get("kind")?;

    let attachment = match row.try_get::<Option<String>, _>("attachment_path")? {
        Some(path) => Some(AttachmentRef {
            path,
            name: row
                .try_get::<Option<String>, _>("attachment_name")?
                .unwrap_or_default(),
            size: row
                .try_get::<Option<i64>, _>("attachment_size")?
                .unwrap_or_default() as u64,
            mime: row
                .try_get::<Option<String>, _>("attachment_mime")?
                .unwrap_or_default(),
        }),
        None => None,
    };

    Ok(ChatMessage {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        sender_id: row.try_get("sender_id")?,
        sender_role: role.parse()?,
        body: row.try_get("body")?,
        kind: kind.parse()?,
        attachment,
        is_read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}
