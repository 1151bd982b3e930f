//! Conversation and scheduled-task persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chat_llm::{ConversationId, Message};
use chat_tools::{ScheduledTask, TaskId};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns an empty history for conversations never saved.
    async fn load_history(&self, id: &ConversationId) -> Result<Vec<Message>>;
    async fn save_history(&self, id: &ConversationId, messages: &[Message]) -> Result<()>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_tasks(&self) -> Result<Vec<ScheduledTask>>;
    async fn upsert_task(&self, task: &ScheduledTask) -> Result<()>;
    async fn delete_task(&self, id: &TaskId) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, Vec<Message>>,
    tasks: DashMap<TaskId, ScheduledTask>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load_history(&self, id: &ConversationId) -> Result<Vec<Message>> {
        Ok(self
            .conversations
            .get(id)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }

    async fn save_history(&self, id: &ConversationId, messages: &[Message]) -> Result<()> {
        self.conversations.insert(id.clone(), messages.to_vec());
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn load_tasks(&self) -> Result<Vec<ScheduledTask>> {
        Ok(self.tasks.iter().map(|t| t.value().clone()).collect())
    }

    async fn upsert_task(&self, task: &ScheduledTask) -> Result<()> {
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: &TaskId) -> Result<()> {
        self.tasks.remove(id);
        Ok(())
    }
}

/// SQLite-backed store. Each operation opens its own connection on the
/// blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        let store = Self {
            path: data_dir.join("chat-agent.sqlite3"),
        };
        store.ensure_schema().await?;
        tracing::info!(path = %store.path.display(), "sqlite store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
CREATE TABLE IF NOT EXISTS conversations (
    conversation_id TEXT PRIMARY KEY,
    messages_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS scheduled_tasks (
    task_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    task_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_conversation
ON scheduled_tasks (conversation_id);
"#,
            )?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("open sqlite db: {}", path.display()))?;
            conn.busy_timeout(Duration::from_millis(1000))
                .context("set sqlite busy timeout")?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load_history(&self, id: &ConversationId) -> Result<Vec<Message>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT messages_json FROM conversations WHERE conversation_id = ?1",
            )?;
            let json: Option<String> = stmt
                .query_row(params![id.as_str()], |row| row.get(0))
                .optional()?;
            match json {
                Some(json) => serde_json::from_str(&json)
                    .with_context(|| format!("decode history for conversation {id}")),
                None => Ok(Vec::new()),
            }
        })
        .await
    }

    async fn save_history(&self, id: &ConversationId, messages: &[Message]) -> Result<()> {
        let id = id.clone();
        let json = serde_json::to_string(messages)?;
        self.with_conn(move |conn| {
            conn.prepare_cached(
                r#"
INSERT INTO conversations (conversation_id, messages_json, updated_at)
VALUES (?1, ?2, CURRENT_TIMESTAMP)
ON CONFLICT(conversation_id) DO UPDATE
SET messages_json = excluded.messages_json,
    updated_at = CURRENT_TIMESTAMP
"#,
            )?
            .execute(params![id.as_str(), json])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn load_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT task_id, task_json FROM scheduled_tasks")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (task_id, json) = row?;
                match serde_json::from_str::<ScheduledTask>(&json) {
                    Ok(task) => out.push(task),
                    Err(e) => {
                        tracing::warn!(%task_id, error = %e, "skipping undecodable scheduled task")
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    async fn upsert_task(&self, task: &ScheduledTask) -> Result<()> {
        let task_id = task.id.to_string();
        let conversation_id = task.conversation_id.to_string();
        let json = serde_json::to_string(task)?;
        self.with_conn(move |conn| {
            conn.prepare_cached(
                r#"
INSERT INTO scheduled_tasks (task_id, conversation_id, task_json, updated_at)
VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
ON CONFLICT(task_id) DO UPDATE
SET task_json = excluded.task_json,
    updated_at = CURRENT_TIMESTAMP
"#,
            )?
            .execute(params![task_id, conversation_id, json])?;
            Ok(())
        })
        .await
    }

    async fn delete_task(&self, id: &TaskId) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.prepare_cached("DELETE FROM scheduled_tasks WHERE task_id = ?1")?
                .execute(params![id])?;
            Ok(())
        })
        .await
    }
}
