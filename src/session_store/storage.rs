//! Queries over one project's isolated session database.
//!
//! Only the owning instance touches this database; no external component
//! writes it.

use crate::constants::SESSION_TOPIC_MAX_CHARS;
use crate::models::new_entity_id;
use crate::{Result, StratoError};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "stopped" => Ok(SessionStatus::Stopped),
            _ => Err(format!("Unknown session status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            _ => Err(format!("Unknown message role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub workspace_id: Option<String>,
    pub task_id: Option<String>,
    pub topic: Option<String>,
    pub status: SessionStatus,
    pub message_count: i64,
    pub agent_completed_at: Option<i64>,
    pub suspended_at: Option<i64>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_metadata: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: String,
    pub event_type: String,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    /// Opaque pre-serialised JSON; the event_type is the discriminator.
    pub payload: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct IdleCleanupSchedule {
    pub session_id: String,
    pub workspace_id: String,
    pub task_id: Option<String>,
    /// Epoch ms.
    pub cleanup_at: i64,
    pub retry_count: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
}

/// Wire format of a client-submitted message. The client-supplied id is the
/// idempotency key for batch replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub message_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tool_metadata: Option<String>,
    /// ISO-8601; falls back to arrival time when absent or unparseable.
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub persisted: usize,
    pub duplicates: usize,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// First user message becomes the topic, truncated with an ellipsis.
pub fn capture_topic(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= SESSION_TOPIC_MAX_CHARS {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(SESSION_TOPIC_MAX_CHARS).collect();
    format!("{head}…")
}

#[derive(Clone)]
pub struct SessionDb {
    pool: SqlitePool,
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse().map_err(StratoError::CorruptState)
}

fn session_from_row(row: &SqliteRow) -> Result<ChatSession> {
    Ok(ChatSession {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        task_id: row.get("task_id"),
        topic: row.get("topic"),
        status: parse_enum(row.get::<String, _>("status").as_str())?,
        message_count: row.get("message_count"),
        agent_completed_at: row.get("agent_completed_at"),
        suspended_at: row.get("suspended_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role: parse_enum(row.get::<String, _>("role").as_str())?,
        content: row.get("content"),
        tool_metadata: row.get("tool_metadata"),
        created_at: row.get("created_at"),
    })
}

fn activity_from_row(row: &SqliteRow) -> ActivityEvent {
    ActivityEvent {
        id: row.get("id"),
        event_type: row.get("event_type"),
        actor_type: row.get("actor_type"),
        actor_id: row.get("actor_id"),
        workspace_id: row.get("workspace_id"),
        session_id: row.get("session_id"),
        task_id: row.get("task_id"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    }
}

fn schedule_from_row(row: &SqliteRow) -> IdleCleanupSchedule {
    IdleCleanupSchedule {
        session_id: row.get("session_id"),
        workspace_id: row.get("workspace_id"),
        task_id: row.get("task_id"),
        cleanup_at: row.get("cleanup_at"),
        retry_count: row.get("retry_count"),
        created_at: row.get("created_at"),
    }
}

impl SessionDb {
    /// Open the project database file, creating it when absent. Migrations
    /// run separately under the instance startup barrier.
    pub async fn open(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        if !sqlx::Sqlite::database_exists(&url).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(&url).await?;
        }
        let pool = SqlitePool::connect(&url).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- meta ----

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO do_meta (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM do_meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    // ---- sessions ----

    pub async fn count_sessions(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chat_sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn count_active_sessions(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chat_sessions WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn insert_session(
        &self,
        workspace_id: Option<&str>,
        topic: Option<&str>,
        task_id: Option<&str>,
    ) -> Result<ChatSession> {
        let session = ChatSession {
            id: new_entity_id(),
            workspace_id: workspace_id.map(|s| s.to_string()),
            task_id: task_id.map(|s| s.to_string()),
            topic: topic.map(|s| s.to_string()),
            status: SessionStatus::Active,
            message_count: 0,
            agent_completed_at: None,
            suspended_at: None,
            started_at: now_ms(),
            ended_at: None,
        };
        sqlx::query(
            "INSERT INTO chat_sessions (id, workspace_id, task_id, topic, status, message_count, started_at) \
             VALUES (?1, ?2, ?3, ?4, 'active', 0, ?5)",
        )
        .bind(&session.id)
        .bind(&session.workspace_id)
        .bind(&session.task_id)
        .bind(&session.topic)
        .bind(session.started_at)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        task_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_sessions \
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_id = ?2) \
             ORDER BY started_at DESC, rowid DESC LIMIT ?3 OFFSET ?4",
        )
        .bind(status.map(|s| s.as_str()))
        .bind(task_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// Conditional stop; false when the session was not active.
    pub async fn stop_session(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET status = 'stopped', ended_at = ?2 \
             WHERE id = ?1 AND status = 'active'",
        )
        .bind(session_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set `agent_completed_at` only if not already set.
    pub async fn mark_agent_completed(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET agent_completed_at = ?2 \
             WHERE id = ?1 AND agent_completed_at IS NULL",
        )
        .bind(session_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_session_workspace(&self, session_id: &str, workspace_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE chat_sessions SET workspace_id = ?2 WHERE id = ?1")
            .bind(session_id)
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_topic_if_unset(&self, session_id: &str, topic: &str) -> Result<()> {
        sqlx::query(
            "UPDATE chat_sessions SET topic = ?2 \
             WHERE id = ?1 AND (topic IS NULL OR topic = '')",
        )
        .bind(session_id)
        .bind(topic)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- messages ----

    pub async fn message_exists(&self, session_id: &str, message_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS x FROM chat_messages WHERE session_id = ?1 AND id = ?2")
            .bind(session_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn count_messages(&self, session_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chat_messages WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Insert one message and keep the session row's counters and topic in
    /// step with it.
    pub async fn insert_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        role: MessageRole,
        content: &str,
        tool_metadata: Option<&str>,
        created_at: Option<i64>,
    ) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: message_id
                .map(|s| s.to_string())
                .unwrap_or_else(new_entity_id),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            tool_metadata: tool_metadata.map(|s| s.to_string()),
            created_at: created_at.unwrap_or_else(now_ms),
        };
        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, role, content, tool_metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.tool_metadata)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE chat_sessions SET message_count = message_count + 1 WHERE id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        if role == MessageRole::User {
            self.set_topic_if_unset(session_id, &capture_topic(content))
                .await?;
        }

        Ok(message)
    }

    /// Descending page of messages before an exclusive timestamp cursor.
    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        before: Option<i64>,
    ) -> Result<MessagePage> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages \
             WHERE session_id = ?1 AND (?2 IS NULL OR created_at < ?2) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
        )
        .bind(session_id)
        .bind(before)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > limit;
        let messages = rows
            .iter()
            .take(limit as usize)
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(MessagePage { messages, has_more })
    }

    // ---- activity events ----

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_activity(
        &self,
        event_type: &str,
        actor_type: &str,
        actor_id: Option<&str>,
        workspace_id: Option<&str>,
        session_id: Option<&str>,
        task_id: Option<&str>,
        payload: Option<&str>,
    ) -> Result<ActivityEvent> {
        let event = ActivityEvent {
            id: new_entity_id(),
            event_type: event_type.to_string(),
            actor_type: actor_type.to_string(),
            actor_id: actor_id.map(|s| s.to_string()),
            workspace_id: workspace_id.map(|s| s.to_string()),
            session_id: session_id.map(|s| s.to_string()),
            task_id: task_id.map(|s| s.to_string()),
            payload: payload.map(|s| s.to_string()),
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO activity_events \
             (id, event_type, actor_type, actor_id, workspace_id, session_id, task_id, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.actor_type)
        .bind(&event.actor_id)
        .bind(&event.workspace_id)
        .bind(&event.session_id)
        .bind(&event.task_id)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(event)
    }

    pub async fn list_activity(
        &self,
        event_type: Option<&str>,
        limit: i64,
        before: Option<i64>,
    ) -> Result<Vec<ActivityEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM activity_events \
             WHERE (?1 IS NULL OR event_type = ?1) AND (?2 IS NULL OR created_at < ?2) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
        )
        .bind(event_type)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(activity_from_row).collect())
    }

    pub async fn latest_activity_at(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(created_at) AS latest FROM activity_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("latest"))
    }

    // ---- idle cleanup schedules ----

    pub async fn upsert_cleanup_schedule(
        &self,
        session_id: &str,
        workspace_id: &str,
        task_id: Option<&str>,
        cleanup_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO idle_cleanup_schedules \
             (session_id, workspace_id, task_id, cleanup_at, retry_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5) \
             ON CONFLICT(session_id) DO UPDATE SET \
             workspace_id = ?2, task_id = ?3, cleanup_at = ?4, retry_count = 0",
        )
        .bind(session_id)
        .bind(workspace_id)
        .bind(task_id)
        .bind(cleanup_at)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_cleanup_schedule(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM idle_cleanup_schedules WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Push an existing schedule out to a new deadline; false if absent.
    pub async fn reset_cleanup_schedule(&self, session_id: &str, cleanup_at: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE idle_cleanup_schedules SET cleanup_at = ?2, retry_count = 0 \
             WHERE session_id = ?1",
        )
        .bind(session_id)
        .bind(cleanup_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_cleanup_retry(
        &self,
        session_id: &str,
        cleanup_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE idle_cleanup_schedules SET retry_count = retry_count + 1, cleanup_at = ?2 \
             WHERE session_id = ?1",
        )
        .bind(session_id)
        .bind(cleanup_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn expired_cleanup_schedules(&self, now: i64) -> Result<Vec<IdleCleanupSchedule>> {
        let rows = sqlx::query(
            "SELECT * FROM idle_cleanup_schedules WHERE cleanup_at <= ?1 ORDER BY cleanup_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(schedule_from_row).collect())
    }

    pub async fn next_cleanup_at(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MIN(cleanup_at) AS next FROM idle_cleanup_schedules")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("next"))
    }
}
