use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteRow;
use tracing::warn;

use overpass_protocol::Turn;
use overpass_protocol::TurnRole;

use crate::model::EditRecord;
use crate::model::SessionRecord;
use crate::model::TaskRecord;
use crate::model::TestRunRecord;
use crate::model::epoch_millis;
use crate::model::from_epoch_millis;
use crate::schema::SCHEMA;

/// Durable store for sessions, history, tasks, edits, and test runs.
///
/// All writes serialize through the pool; callers never take external
/// locks. A single writer process is assumed.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if necessary) the database at `path` and apply the
    /// schema. Parent directories are created as needed.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .with_context(|| format!("invalid database path {}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open session db at {}", path.display()))?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to apply schema")?;
        }
        Ok(())
    }

    /// Fetch the session, creating an empty one if it does not exist.
    pub async fn get_or_create_session(&self, id: &str) -> Result<SessionRecord> {
        let now = epoch_millis(Utc::now());
        sqlx::query(
            "INSERT INTO sessions (id, created_at, updated_at, metadata)
             VALUES (?, ?, ?, '{}')
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_session(id)
            .await?
            .context("session vanished after insert")
    }

    /// Fetch a session with its full ordered history, or `None`.
    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT id, created_at, updated_at, metadata FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let metadata: Value = serde_json::from_str(&row.try_get::<String, _>("metadata")?)
            .unwrap_or(Value::Object(Default::default()));
        let history_rows = sqlx::query(
            "SELECT role, kind, status, content, metadata, created_at
             FROM session_history WHERE session_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(history_rows.len());
        for row in &history_rows {
            match turn_from_row(row) {
                Ok(turn) => history.push(turn),
                Err(err) => warn!("skipping unreadable history row for session {id}: {err:#}"),
            }
        }

        Ok(Some(SessionRecord {
            id: row.try_get("id")?,
            created_at: from_epoch_millis(row.try_get("created_at")?),
            updated_at: from_epoch_millis(row.try_get("updated_at")?),
            metadata,
            history,
        }))
    }

    /// Append one turn to a session's history; creates the session if
    /// needed and bumps its `updated_at`.
    pub async fn append_turn(&self, id: &str, turn: &Turn) -> Result<()> {
        self.get_or_create_session(id).await?;
        let metadata_json = turn
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO session_history (session_id, role, kind, status, content, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(turn.role.as_str())
        .bind(&turn.kind)
        .bind(turn.status)
        .bind(serde_json::to_string(&turn.content)?)
        .bind(metadata_json)
        .bind(epoch_millis(turn.timestamp))
        .execute(&self.pool)
        .await?;
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(epoch_millis(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Merge metadata keys into the session's metadata object.
    pub async fn upsert_session(&self, id: &str, metadata: &Value) -> Result<()> {
        let mut record = self.get_or_create_session(id).await?;
        if let (Value::Object(existing), Value::Object(incoming)) =
            (&mut record.metadata, metadata)
        {
            for (key, value) in incoming {
                existing.insert(key.clone(), value.clone());
            }
        } else if !metadata.is_null() {
            record.metadata = metadata.clone();
        }
        sqlx::query("UPDATE sessions SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&record.metadata)?)
            .bind(epoch_millis(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a session; history rows cascade. Returns whether a row was
    /// removed.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_task(
        &self,
        id: &str,
        session_id: Option<&str>,
        title: &str,
        description: &str,
    ) -> Result<TaskRecord> {
        let now = epoch_millis(Utc::now());
        sqlx::query(
            "INSERT INTO tasks (id, session_id, title, description, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'open', ?, ?)",
        )
        .bind(id)
        .bind(session_id)
        .bind(title)
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_task(id).await?.context("task vanished after insert")
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT id, session_id, title, description, status, created_at, updated_at
             FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| task_from_row(&row)).transpose()
    }

    pub async fn update_task(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<TaskRecord>> {
        if title.is_none() && description.is_none() {
            return self.get_task(id).await;
        }
        sqlx::query(
            "UPDATE tasks SET
                title = COALESCE(?, title),
                description = COALESCE(?, description),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(title)
        .bind(description)
        .bind(epoch_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_task(id).await
    }

    pub async fn set_task_status(&self, id: &str, status: &str) -> Result<Option<TaskRecord>> {
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(epoch_millis(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_task(id).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_tasks(&self, session_id: Option<&str>) -> Result<Vec<TaskRecord>> {
        let rows = match session_id {
            Some(session_id) => {
                sqlx::query(
                    "SELECT id, session_id, title, description, status, created_at, updated_at
                     FROM tasks WHERE session_id = ? ORDER BY created_at",
                )
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, session_id, title, description, status, created_at, updated_at
                     FROM tasks ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(task_from_row).collect()
    }

    /// Record a before/after snapshot for a workspace write.
    pub async fn record_edit(
        &self,
        id: &str,
        session_id: Option<&str>,
        path: &str,
        before: Option<&str>,
        after: Option<&str>,
        tool: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO edits (id, session_id, path, before_content, after_content, tool, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(session_id)
        .bind(path)
        .bind(before)
        .bind(after)
        .bind(tool)
        .bind(epoch_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_edit(&self, id: &str) -> Result<Option<EditRecord>> {
        let row = sqlx::query(
            "SELECT id, session_id, path, before_content, after_content, tool, created_at
             FROM edits WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| edit_from_row(&row)).transpose()
    }

    /// Most-recent-first edit history, optionally filtered by path.
    pub async fn list_edits(&self, path: Option<&str>, limit: i64) -> Result<Vec<EditRecord>> {
        let rows = match path {
            Some(path) => {
                sqlx::query(
                    "SELECT id, session_id, path, before_content, after_content, tool, created_at
                     FROM edits WHERE path = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(path)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, session_id, path, before_content, after_content, tool, created_at
                     FROM edits ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(edit_from_row).collect()
    }

    pub async fn record_test_run(
        &self,
        id: &str,
        session_id: Option<&str>,
        command: &str,
        exit_code: Option<i64>,
        output: &str,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO test_runs (id, session_id, command, exit_code, output, duration_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(session_id)
        .bind(command)
        .bind(exit_code)
        .bind(output)
        .bind(duration_ms)
        .bind(epoch_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_test_runs(&self, limit: i64) -> Result<Vec<TestRunRecord>> {
        let rows = sqlx::query(
            "SELECT id, session_id, command, exit_code, output, duration_ms, created_at
             FROM test_runs ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(test_run_from_row).collect()
    }
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn> {
    let role_text: String = row.try_get("role")?;
    let role = TurnRole::parse(&role_text)
        .with_context(|| format!("unknown turn role {role_text:?}"))?;
    let content: Value = serde_json::from_str(&row.try_get::<String, _>("content")?)?;
    let metadata = row
        .try_get::<Option<String>, _>("metadata")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    Ok(Turn {
        role,
        kind: row.try_get("kind")?,
        status: row.try_get("status")?,
        content,
        metadata,
        timestamp: from_epoch_millis(row.try_get("created_at")?),
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: row.try_get("status")?,
        created_at: from_epoch_millis(row.try_get("created_at")?),
        updated_at: from_epoch_millis(row.try_get("updated_at")?),
    })
}

fn edit_from_row(row: &SqliteRow) -> Result<EditRecord> {
    Ok(EditRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        path: row.try_get("path")?,
        before_content: row.try_get("before_content")?,
        after_content: row.try_get("after_content")?,
        tool: row.try_get("tool")?,
        created_at: from_epoch_millis(row.try_get("created_at")?),
    })
}

fn test_run_from_row(row: &SqliteRow) -> Result<TestRunRecord> {
    Ok(TestRunRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        command: row.try_get("command")?,
        exit_code: row.try_get("exit_code")?,
        output: row.try_get("output")?,
        duration_ms: row.try_get("duration_ms")?,
        created_at: from_epoch_millis(row.try_get("created_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use overpass_protocol::TurnRole;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("sessions.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn append_then_get_preserves_turn() {
        let (_dir, store) = store().await;
        let before = Utc::now();
        let turn = Turn::new(TurnRole::Tool, "tool_result", json!({"tool_use_id": "t1"}))
            .with_status(200)
            .with_metadata(json!({"tool": "fs_read"}));
        store.append_turn("s-1", &turn).await.unwrap();

        let record = store.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(record.history.len(), 1);
        let got = &record.history[0];
        assert_eq!(got.role, TurnRole::Tool);
        assert_eq!(got.kind, "tool_result");
        assert_eq!(got.status, Some(200));
        assert_eq!(got.content, json!({"tool_use_id": "t1"}));
        assert_eq!(got.metadata, Some(json!({"tool": "fs_read"})));
        assert!(got.timestamp >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn history_preserves_insertion_order() {
        let (_dir, store) = store().await;
        for i in 0..5 {
            let turn = Turn::new(TurnRole::User, "message", json!({"i": i}));
            store.append_turn("s-ord", &turn).await.unwrap();
        }
        let record = store.get_session("s-ord").await.unwrap().unwrap();
        let order: Vec<i64> = record
            .history
            .iter()
            .map(|t| t.content["i"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delete_session_cascades_history() {
        let (_dir, store) = store().await;
        let turn = Turn::new(TurnRole::User, "message", json!("hi"));
        store.append_turn("s-del", &turn).await.unwrap();
        assert!(store.delete_session("s-del").await.unwrap());
        assert!(store.get_session("s-del").await.unwrap().is_none());
        assert!(!store.delete_session("s-del").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_merges_metadata() {
        let (_dir, store) = store().await;
        store
            .upsert_session("s-meta", &json!({"a": 1}))
            .await
            .unwrap();
        store
            .upsert_session("s-meta", &json!({"b": 2}))
            .await
            .unwrap();
        let record = store.get_session("s-meta").await.unwrap().unwrap();
        assert_eq!(record.metadata, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn task_lifecycle() {
        let (_dir, store) = store().await;
        let task = store
            .create_task("t-1", Some("s-1"), "write docs", "for the proxy")
            .await
            .unwrap();
        assert_eq!(task.status, "open");
        let task = store
            .set_task_status("t-1", "done")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, "done");
        let tasks = store.list_tasks(Some("s-1")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(store.delete_task("t-1").await.unwrap());
        assert!(store.get_task("t-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edits_list_most_recent_first() {
        let (_dir, store) = store().await;
        store
            .record_edit("e-1", None, "a.txt", None, Some("one"), "fs_write")
            .await
            .unwrap();
        store
            .record_edit("e-2", None, "a.txt", Some("one"), Some("two"), "fs_write")
            .await
            .unwrap();
        let edits = store.list_edits(Some("a.txt"), 10).await.unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].id, "e-2");
        assert_eq!(edits[1].after_content.as_deref(), Some("one"));
    }
}
