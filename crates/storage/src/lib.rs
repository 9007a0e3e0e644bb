use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ClientId, ConversationId, MessageId, MessageKind, TempId, UserId};
use shared::protocol::MessageRow;

/// Rows retained per conversation in the message cache. Older rows are
/// pruned on every refresh.
const CACHE_ROWS_PER_CONVERSATION: i64 = 200;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Durable record of a message that must still be delivered. Keyed by
/// `client_id`; deleted only after the corresponding write is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxItem {
    pub client_id: ClientId,
    pub temp_id: TempId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Appends a pending send. A second put with the same `client_id` is a
    /// no-op, so retries of the same logical send never create a second
    /// durable record.
    pub async fn outbox_put(&self, item: &OutboxItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO outbox (client_id, temp_id, conversation_id, sender_id, content, kind, media_url, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(client_id) DO NOTHING",
        )
        .bind(item.client_id.as_str())
        .bind(item.temp_id.as_str())
        .bind(item.conversation_id.as_str())
        .bind(item.sender_id.as_str())
        .bind(&item.content)
        .bind(item.kind.as_str())
        .bind(item.media_url.as_deref())
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All pending items, oldest first, preserving send ordering on replay.
    pub async fn outbox_all(&self) -> Result<Vec<OutboxItem>> {
        let rows = sqlx::query(
            "SELECT client_id, temp_id, conversation_id, sender_id, content, kind, media_url, created_at
             FROM outbox
             ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| OutboxItem {
                client_id: ClientId(r.get::<String, _>(0)),
                temp_id: TempId(r.get::<String, _>(1)),
                conversation_id: ConversationId(r.get::<String, _>(2)),
                sender_id: UserId(r.get::<String, _>(3)),
                content: r.get::<String, _>(4),
                kind: MessageKind::parse(&r.get::<String, _>(5)),
                media_url: r.get::<Option<String>, _>(6),
                created_at: r.get::<DateTime<Utc>, _>(7),
            })
            .collect())
    }

    pub async fn outbox_delete(&self, client_id: &ClientId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outbox WHERE client_id = ?")
            .bind(client_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Purges every queued item for a conversation. Used when the user
    /// deletes the conversation itself.
    pub async fn outbox_delete_conversation(&self, conversation_id: &ConversationId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Upserts fetched rows into the per-conversation cache and prunes the
    /// cache back down to the retention bound.
    pub async fn cache_messages(
        &self,
        conversation_id: &ConversationId,
        rows: &[MessageRow],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO message_cache (conversation_id, message_id, sender_id, content, kind, media_url, client_id, reply_to_message_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(conversation_id, message_id) DO UPDATE SET
                    content = excluded.content,
                    media_url = excluded.media_url,
                    client_id = excluded.client_id",
            )
            .bind(conversation_id.as_str())
            .bind(row.id.as_str())
            .bind(row.sender_id.as_str())
            .bind(&row.content)
            .bind(row.kind.as_str())
            .bind(row.media_url.as_deref())
            .bind(row.client_id.as_ref().map(|id| id.as_str().to_string()))
            .bind(row.reply_to_message_id.as_ref().map(|id| id.as_str().to_string()))
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "DELETE FROM message_cache
             WHERE conversation_id = ? AND message_id NOT IN (
                SELECT message_id FROM message_cache
                WHERE conversation_id = ?
                ORDER BY created_at DESC
                LIMIT ?
             )",
        )
        .bind(conversation_id.as_str())
        .bind(conversation_id.as_str())
        .bind(CACHE_ROWS_PER_CONVERSATION)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Most recent cached rows for a conversation, in chronological order.
    pub async fn cached_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        let mut rows = sqlx::query(
            "SELECT message_id, sender_id, content, kind, media_url, client_id, reply_to_message_id, created_at
             FROM message_cache
             WHERE conversation_id = ?
             ORDER BY created_at DESC
             LIMIT ?",
        )
        .bind(conversation_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows
            .into_iter()
            .map(|r| MessageRow {
                id: MessageId(r.get::<String, _>(0)),
                conversation_id: conversation_id.clone(),
                sender_id: UserId(r.get::<String, _>(1)),
                content: r.get::<String, _>(2),
                kind: MessageKind::parse(&r.get::<String, _>(3)),
                media_url: r.get::<Option<String>, _>(4),
                client_id: r.get::<Option<String>, _>(5).map(ClientId),
                reply_to_message_id: r.get::<Option<String>, _>(6).map(MessageId),
                reply_to: None,
                created_at: r.get::<DateTime<Utc>, _>(7),
            })
            .collect())
    }

    pub async fn clear_cached_messages(&self, conversation_id: &ConversationId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM message_cache WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Records a deleted conversation permanently. Inserting the same id
    /// twice is a no-op.
    pub async fn deny_list_add(&self, conversation_id: &ConversationId) -> Result<()> {
        sqlx::query(
            "INSERT INTO deleted_conversations (conversation_id) VALUES (?)
             ON CONFLICT(conversation_id) DO NOTHING",
        )
        .bind(conversation_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deny_list_contains(&self, conversation_id: &ConversationId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM deleted_conversations WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn deny_list_all(&self) -> Result<Vec<ConversationId>> {
        let rows = sqlx::query("SELECT conversation_id FROM deleted_conversations")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ConversationId(r.get::<String, _>(0)))
            .collect())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
