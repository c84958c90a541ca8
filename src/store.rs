use crate::{
    chat::{ChatMessage, NewMessage, ReactionChange, Reactions},
    entity::UserId,
};
use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

/// Result of a reaction toggle against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ReactionToggle {
    Applied {
        reactions: Reactions,
        change: ReactionChange,
    },
    MissingMessage,
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
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database. Every pooled connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
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
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id INTEGER NOT NULL,
                receiver_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                is_sent BOOLEAN NOT NULL DEFAULT 0,
                is_read BOOLEAN NOT NULL DEFAULT 0,
                reactions TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages(receiver_id, is_read);
            CREATE INDEX IF NOT EXISTS idx_messages_pair_created
                ON messages(sender_id, receiver_id, created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Persist a message. The stored row is always flagged as sent.
    pub async fn insert_message(&self, msg: &NewMessage) -> Result<ChatMessage> {
        let reactions = Reactions::default();
        let reactions_json = serde_json::to_string(&reactions)?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (sender_id, receiver_id, text, is_sent, is_read, reactions, created_at)
            VALUES (?, ?, ?, 1, ?, ?, ?)
            "#,
        )
        .bind(msg.sender_id.0)
        .bind(msg.receiver_id.0)
        .bind(&msg.text)
        .bind(msg.is_read)
        .bind(&reactions_json)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save message")?;

        Ok(ChatMessage {
            id: result.last_insert_rowid(),
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            text: msg.text.clone(),
            is_sent: true,
            is_read: msg.is_read,
            reactions,
            created_at: msg.created_at,
        })
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, sender_id, receiver_id, text, is_sent, is_read, reactions, created_at
            FROM messages
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch message")?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// Flag a message as read. Returns false if no such message exists.
    /// `is_read` only ever moves from false to true.
    pub async fn mark_read(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark message as read")?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark every unread message `sender -> receiver` as read, returning the ids
    /// that were flipped, oldest first.
    pub async fn mark_read_from(&self, receiver: UserId, sender: UserId) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM messages
            WHERE receiver_id = ? AND sender_id = ? AND is_read = 0
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(receiver.0)
        .bind(sender.0)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to fetch unread messages")?;

        for id in &ids {
            sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ?")
                .bind(*id)
                .execute(&mut *tx)
                .await
                .context("Failed to mark message as read")?;
        }

        tx.commit().await.context("Failed to commit read sweep")?;
        Ok(ids)
    }

    /// Number of messages addressed to `user` that are still unread.
    pub async fn count_unread(&self, user: UserId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE receiver_id = ? AND is_read = 0",
        )
        .bind(user.0)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count unread messages")?;

        Ok(count)
    }

    /// Retrieve the conversation between two users in both directions.
    /// Returns the latest `limit` messages ordered oldest to newest.
    pub async fn history(&self, a: UserId, b: UserId, limit: i64) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sender_id, receiver_id, text, is_sent, is_read, reactions, created_at
            FROM messages
            WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(a.0)
        .bind(b.0)
        .bind(b.0)
        .bind(a.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat history")?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

        messages.reverse();
        Ok(messages)
    }

    /// Toggle `user`'s reaction on a message.
    ///
    /// The reactions column is swapped only if it still holds the value that was
    /// read, so concurrent toggles from different users never lose an update.
    /// A lost round means another writer landed, so retrying always makes progress.
    pub async fn toggle_reaction(
        &self,
        id: i64,
        user: UserId,
        reaction: &str,
    ) -> Result<ReactionToggle> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let current: Option<String> =
                sqlx::query_scalar("SELECT reactions FROM messages WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .context("Failed to load reactions")?;

            let Some(current) = current else {
                return Ok(ReactionToggle::MissingMessage);
            };

            let mut reactions: Reactions =
                serde_json::from_str(&current).context("Corrupt reactions column")?;
            let change = reactions.toggle(user, reaction);
            let next = serde_json::to_string(&reactions)?;

            let result =
                sqlx::query("UPDATE messages SET reactions = ? WHERE id = ? AND reactions = ?")
                    .bind(&next)
                    .bind(id)
                    .bind(&current)
                    .execute(&self.pool)
                    .await
                    .context("Failed to save reactions")?;

            if result.rows_affected() == 1 {
                return Ok(ReactionToggle::Applied { reactions, change });
            }

            debug!("Reaction CAS on message {} lost race (attempt {})", id, attempt);
            tokio::task::yield_now().await;
        }
    }
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let reactions: String = row.try_get("reactions")?;

    Ok(ChatMessage {
        id: row.try_get("id")?,
        sender_id: UserId(row.try_get("sender_id")?),
        receiver_id: UserId(row.try_get("receiver_id")?),
        text: row.try_get("text")?,
        is_sent: row.try_get("is_sent")?,
        is_read: row.try_get("is_read")?,
        reactions: serde_json::from_str(&reactions).context("Corrupt reactions column")?,
        created_at: row.try_get("created_at")?,
    })
}
