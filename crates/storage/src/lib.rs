use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{GeoPoint, GroupId, MessageId, MessageKind, UserId},
    protocol::{MessageRow, NewMessageRow},
};

const MESSAGE_COLUMNS: &str = "id, group_id, sender_id, sender_name, message_type, text, voice_url, \
    voice_duration, mentions, edited, sos_location, sos_timestamp, created_at, updated_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
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

    pub async fn insert_message(&self, message: &NewMessageRow) -> Result<MessageRow> {
        let now = Utc::now();
        let mentions = serde_json::to_string(&message.mentions)?;
        let sos_location = message
            .sos_location
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = sqlx::query(&format!(
            "INSERT INTO group_chat_messages
               (group_id, sender_id, sender_name, message_type, text, voice_url, voice_duration,
                mentions, edited, sos_location, sos_timestamp, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message.group_id.0)
        .bind(message.sender_id.0)
        .bind(&message.sender_name)
        .bind(message.message_type.as_str())
        .bind(message.text.as_deref())
        .bind(message.voice_url.as_deref())
        .bind(message.voice_duration.map(i64::from))
        .bind(mentions)
        .bind(sos_location)
        .bind(message.sos_timestamp)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert chat message")?;

        message_from_row(&row)
    }

    pub async fn list_group_messages(&self, group_id: GroupId) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM group_chat_messages
             WHERE group_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(group_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<MessageRow>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM group_chat_messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn update_message_text(
        &self,
        message_id: MessageId,
        text: &str,
        edited: bool,
    ) -> Result<Option<MessageRow>> {
        let row = sqlx::query(&format!(
            "UPDATE group_chat_messages
             SET text = ?, edited = ?, updated_at = ?
             WHERE id = ?
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(text)
        .bind(edited)
        .bind(Utc::now())
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to update chat message")?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// Deletes a message and returns the group it belonged to.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<Option<GroupId>> {
        let row = sqlx::query("DELETE FROM group_chat_messages WHERE id = ? RETURNING group_id")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to delete chat message")?;
        Ok(row.map(|r| GroupId(r.get::<i64, _>(0))))
    }

    pub async fn purge_group(&self, group_id: GroupId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM group_chat_messages WHERE group_id = ?")
            .bind(group_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn save_read_marker(
        &self,
        user_id: UserId,
        group_id: GroupId,
        last_read_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_read_markers (user_id, group_id, last_read_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id, group_id) DO UPDATE SET last_read_at = excluded.last_read_at",
        )
        .bind(user_id.0)
        .bind(group_id.0)
        .bind(last_read_at)
        .execute(&self.pool)
        .await
        .context("failed to save read marker")?;
        Ok(())
    }

    pub async fn load_read_markers(
        &self,
        user_id: UserId,
    ) -> Result<HashMap<GroupId, DateTime<Utc>>> {
        let rows =
            sqlx::query("SELECT group_id, last_read_at FROM chat_read_markers WHERE user_id = ?")
                .bind(user_id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    GroupId(r.get::<i64, _>(0)),
                    r.get::<DateTime<Utc>, _>(1),
                )
            })
            .collect())
    }
}

fn message_from_row(r: &SqliteRow) -> Result<MessageRow> {
    let raw_kind: String = r.get(4);
    let message_type = MessageKind::parse(&raw_kind)
        .with_context(|| format!("unknown message_type '{raw_kind}'"))?;
    let mentions: Vec<UserId> = serde_json::from_str(&r.get::<String, _>(8))
        .context("invalid mentions column")?;
    let sos_location = r
        .get::<Option<String>, _>(10)
        .map(|raw| serde_json::from_str::<GeoPoint>(&raw))
        .transpose()
        .context("invalid sos_location column")?;

    Ok(MessageRow {
        id: MessageId(r.get::<i64, _>(0)),
        group_id: GroupId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        sender_name: r.get::<String, _>(3),
        message_type,
        text: r.get::<Option<String>, _>(5),
        voice_url: r.get::<Option<String>, _>(6),
        voice_duration: r
            .get::<Option<i64>, _>(7)
            .map(|secs| u32::try_from(secs).unwrap_or(u32::MAX)),
        mentions,
        edited: r.get::<bool, _>(9),
        sos_location,
        sos_timestamp: r.get::<Option<DateTime<Utc>>, _>(11),
        created_at: r.get::<DateTime<Utc>, _>(12),
        updated_at: r.get::<DateTime<Utc>, _>(13),
    })
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
