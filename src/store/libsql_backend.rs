//! libSQL backend: async `Store` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written in
//! the fixed-width form from [`format_timestamp`] so SQL string comparison
//! orders them chronologically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{ChatMessage, RegisteredGroup, format_timestamp};
use crate::scheduler::task::{ScheduledTask, TaskStatus};
use crate::store::migrations;
use crate::store::traits::Store;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    warn!(value = s, "Unparseable timestamp in database");
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert an optional string to a libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_timestamp(ts: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text(ts.as_ref().map(format_timestamp))
}

fn row_to_message(row: &libsql::Row) -> Result<ChatMessage, libsql::Error> {
    let timestamp: String = row.get(5)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        chat_jid: row.get(1)?,
        sender: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        timestamp: parse_datetime(&timestamp),
        is_from_me: row.get::<i64>(6)? != 0,
        is_bot_message: row.get::<i64>(7)? != 0,
    })
}

fn row_to_group(row: &libsql::Row) -> Result<RegisteredGroup, libsql::Error> {
    let added_at: String = row.get(5)?;
    Ok(RegisteredGroup {
        jid: row.get(0)?,
        name: row.get(1)?,
        folder: row.get(2)?,
        trigger_pattern: row.get(3)?,
        requires_trigger: row.get::<i64>(4)? != 0,
        added_at: parse_datetime(&added_at),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<ScheduledTask, DatabaseError> {
    let field = |e: libsql::Error| DatabaseError::Serialization(format!("task row: {e}"));

    let schedule_type: String = row.get(4).map_err(field)?;
    let context_mode: String = row.get(6).map_err(field)?;
    let next_run: Option<String> = row.get(7).ok();
    let last_run: Option<String> = row.get(8).ok();
    let status: String = row.get(10).map_err(field)?;
    let created_at: String = row.get(11).map_err(field)?;

    Ok(ScheduledTask {
        id: row.get(0).map_err(field)?,
        group_folder: row.get(1).map_err(field)?,
        chat_jid: row.get(2).map_err(field)?,
        prompt: row.get(3).map_err(field)?,
        schedule_type: schedule_type
            .parse()
            .map_err(|e| DatabaseError::Serialization(format!("schedule_type: {e}")))?,
        schedule_value: row.get(5).map_err(field)?,
        context_mode: context_mode.parse().unwrap_or_default(),
        next_run: parse_optional_datetime(&next_run),
        last_run: parse_optional_datetime(&last_run),
        last_result: row.get(9).ok(),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const MESSAGE_COLUMNS: &str =
    "id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message";

const GROUP_COLUMNS: &str = "jid, name, folder, trigger_pattern, requires_trigger, added_at";

const TASK_COLUMNS: &str = "id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode, next_run, last_run, last_result, status, created_at";

impl LibSqlBackend {
    async fn query_tasks(
        &self,
        sql: &str,
        op: &str,
    ) -> Result<Vec<ScheduledTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(error = %e, "{op}: skipping unreadable task row"),
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl Store for LibSqlBackend {
    // ── Messages ────────────────────────────────────────────────────

    async fn save_message(&self, message: &ChatMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    message.id.clone(),
                    message.chat_jid.clone(),
                    message.sender.clone(),
                    message.sender_name.clone(),
                    message.content.clone(),
                    format_timestamp(&message.timestamp),
                    message.is_from_me as i64,
                    message.is_bot_message as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_message: {e}")))?;

        debug!(chat_jid = %message.chat_jid, id = %message.id, "Message saved");
        Ok(())
    }

    async fn get_recent_messages(
        &self,
        chat_jid: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_jid = ?1
                     ORDER BY timestamp DESC, rowid DESC
                     LIMIT ?2"
                ),
                params![chat_jid, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let message = row_to_message(&row)
                .map_err(|e| DatabaseError::Query(format!("get_recent_messages row parse: {e}")))?;
            messages.push(message);
        }
        messages.reverse();
        Ok(messages)
    }

    async fn get_new_messages(
        &self,
        chat_jid: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_jid = ?1 AND timestamp > ?2 AND is_bot_message = 0
                     ORDER BY timestamp ASC, rowid ASC"
                ),
                params![chat_jid, format_timestamp(&since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_new_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let message = row_to_message(&row)
                .map_err(|e| DatabaseError::Query(format!("get_new_messages row parse: {e}")))?;
            messages.push(message);
        }
        Ok(messages)
    }

    // ── Groups ──────────────────────────────────────────────────────

    async fn register_group(&self, group: &RegisteredGroup) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO registered_groups ({GROUP_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    group.jid.clone(),
                    group.name.clone(),
                    group.folder.clone(),
                    group.trigger_pattern.clone(),
                    group.requires_trigger as i64,
                    format_timestamp(&group.added_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("register_group: {e}")))?;

        info!(jid = %group.jid, folder = %group.folder, "Group registered");
        Ok(())
    }

    async fn get_registered_groups(&self) -> Result<Vec<RegisteredGroup>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {GROUP_COLUMNS} FROM registered_groups ORDER BY added_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_registered_groups: {e}")))?;

        let mut groups = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let group = row_to_group(&row).map_err(|e| {
                DatabaseError::Query(format!("get_registered_groups row parse: {e}"))
            })?;
            groups.push(group);
        }
        Ok(groups)
    }

    async fn get_group(&self, jid: &str) -> Result<Option<RegisteredGroup>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {GROUP_COLUMNS} FROM registered_groups WHERE jid = ?1"),
                params![jid],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_group: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let group = row_to_group(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_group row parse: {e}")))?;
                Ok(Some(group))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_group: {e}"))),
        }
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn get_or_create_session(&self, group_folder: &str) -> Result<String, DatabaseError> {
        let candidate = format!("{group_folder}-{}", Uuid::new_v4().simple());
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO sessions (group_folder, session_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![group_folder, candidate, format_timestamp(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_or_create_session: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "SELECT session_id FROM sessions WHERE group_folder = ?1",
                params![group_folder],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_or_create_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map_err(|e| DatabaseError::Query(format!("get_or_create_session row parse: {e}"))),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "session".to_string(),
                id: group_folder.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("get_or_create_session: {e}"))),
        }
    }

    // ── Scheduled tasks ─────────────────────────────────────────────

    async fn save_task(&self, task: &ScheduledTask) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO scheduled_tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    task.id.clone(),
                    task.group_folder.clone(),
                    task.chat_jid.clone(),
                    task.prompt.clone(),
                    task.schedule_type.to_string(),
                    task.schedule_value.clone(),
                    task.context_mode.to_string(),
                    opt_timestamp(task.next_run),
                    opt_timestamp(task.last_run),
                    opt_text(task.last_result.clone()),
                    task.status.to_string(),
                    format_timestamp(&task.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_task: {e}")))?;

        debug!(task_id = %task.id, schedule_type = %task.schedule_type, "Task saved");
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_task(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at DESC"),
            "list_tasks",
        )
        .await
    }

    async fn get_active_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE status = 'active'
                 ORDER BY next_run ASC"
            ),
            "get_active_tasks",
        )
        .await
    }

    async fn update_task_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        last_result: &str,
        next_run: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE scheduled_tasks
                 SET last_run = ?1, last_result = ?2, next_run = ?3,
                     status = CASE
                         WHEN status = 'paused' AND ?4 = 'active' THEN status
                         ELSE ?4
                     END
                 WHERE id = ?5",
                params![
                    format_timestamp(&last_run),
                    last_result,
                    opt_timestamp(next_run),
                    status.to_string(),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_run: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "scheduled_task".to_string(),
                id: id.to_string(),
            });
        }
        debug!(task_id = id, status = %status, "Task run recorded");
        Ok(())
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        next_run_if_unset: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE scheduled_tasks
                 SET status = ?1, next_run = COALESCE(next_run, ?2)
                 WHERE id = ?3 AND status != 'completed'",
                params![status.to_string(), opt_timestamp(next_run_if_unset), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_status: {e}")))?;

        debug!(task_id = id, status = %status, changed = affected > 0, "Task status set");
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::scheduler::schedule::Schedule;
    use crate::scheduler::task::{ContextMode, ScheduleType};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn group(jid: &str, folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger_pattern: r"(?i)^@Andy\b".to_string(),
            requires_trigger: true,
            added_at: base_time(),
        }
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn recent_messages_are_bounded_and_chronological() {
        let db = test_db().await;
        for i in 0..5 {
            let msg = ChatMessage::inbound(
                "chat@x",
                "alice",
                &format!("msg {i}"),
                base_time() + Duration::seconds(i),
            );
            db.save_message(&msg).await.unwrap();
        }
        db.save_message(&ChatMessage::inbound("other@x", "bob", "elsewhere", base_time()))
            .await
            .unwrap();

        let recent = db.get_recent_messages("chat@x", 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn new_messages_are_strictly_newer_and_skip_bot() {
        let db = test_db().await;
        let t0 = base_time();
        db.save_message(&ChatMessage::inbound("chat@x", "alice", "old", t0))
            .await
            .unwrap();
        db.save_message(&ChatMessage::inbound("chat@x", "alice", "new", t0 + Duration::milliseconds(1)))
            .await
            .unwrap();
        db.save_message(&ChatMessage::from_assistant(
            "chat@x",
            "Andy",
            "reply",
            t0 + Duration::seconds(1),
        ))
        .await
        .unwrap();

        let fresh = db.get_new_messages("chat@x", t0).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].content, "new");
        assert!(!fresh[0].is_bot_message);
    }

    #[tokio::test]
    async fn saving_same_message_twice_is_noop() {
        let db = test_db().await;
        let msg = ChatMessage::inbound("chat@x", "alice", "hi", base_time());
        db.save_message(&msg).await.unwrap();
        db.save_message(&msg).await.unwrap();
        assert_eq!(db.get_recent_messages("chat@x", 10).await.unwrap().len(), 1);
    }

    // ── Group and session tests ─────────────────────────────────────

    #[tokio::test]
    async fn groups_roundtrip() {
        let db = test_db().await;
        db.register_group(&group("a@x", "alpha")).await.unwrap();
        db.register_group(&group("b@x", "beta")).await.unwrap();

        let groups = db.get_registered_groups().await.unwrap();
        assert_eq!(groups.len(), 2);
        let a = db.get_group("a@x").await.unwrap().unwrap();
        assert_eq!(a, group("a@x", "alpha"));
        assert!(db.get_group("missing@x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_is_stable_per_folder() {
        let db = test_db().await;
        let first = db.get_or_create_session("alpha").await.unwrap();
        let second = db.get_or_create_session("alpha").await.unwrap();
        let other = db.get_or_create_session("beta").await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.starts_with("alpha-"));
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn active_tasks_exclude_paused_and_completed() {
        let db = test_db().await;
        let schedule: Schedule = "interval:1h".parse().unwrap();
        let mut active =
            ScheduledTask::new("alpha", "a@x", "p", &schedule, ContextMode::Group, base_time());
        let mut paused = active.clone();
        paused.id = "paused".to_string();
        paused.status = TaskStatus::Paused;
        let mut done = active.clone();
        done.id = "done".to_string();
        done.status = TaskStatus::Completed;
        active.id = "active".to_string();

        for t in [&active, &paused, &done] {
            db.save_task(t).await.unwrap();
        }

        let tasks = db.get_active_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0], active);
        assert_eq!(tasks[0].schedule_type, ScheduleType::Interval);
        assert_eq!(db.list_tasks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn update_task_run_records_outcome() {
        let db = test_db().await;
        let task = ScheduledTask::new(
            "alpha",
            "a@x",
            "p",
            &Schedule::Once,
            ContextMode::Isolated,
            base_time(),
        );
        db.save_task(&task).await.unwrap();

        let ran_at = base_time() + Duration::minutes(1);
        db.update_task_run(&task.id, ran_at, "done", None, TaskStatus::Completed)
            .await
            .unwrap();

        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.last_run, Some(ran_at));
        assert_eq!(stored.last_result.as_deref(), Some("done"));
        assert_eq!(stored.next_run, None);
    }

    #[tokio::test]
    async fn run_write_back_keeps_pause_unless_completing() {
        let db = test_db().await;
        let schedule: Schedule = "interval:1h".parse().unwrap();
        let task = ScheduledTask::new(
            "alpha",
            "a@x",
            "p",
            &schedule,
            ContextMode::Isolated,
            base_time(),
        );
        db.save_task(&task).await.unwrap();
        assert!(db.set_task_status(&task.id, TaskStatus::Paused, None).await.unwrap());

        let ran_at = base_time() + Duration::hours(1);
        let next = ran_at + Duration::hours(1);
        db.update_task_run(&task.id, ran_at, "ok", Some(next), TaskStatus::Active)
            .await
            .unwrap();
        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Paused);
        assert_eq!(stored.last_run, Some(ran_at));
        assert_eq!(stored.next_run, Some(next));

        db.update_task_run(&task.id, ran_at, "ok", None, TaskStatus::Completed)
            .await
            .unwrap();
        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn status_change_leaves_run_fields_alone() {
        let db = test_db().await;
        let task = ScheduledTask::new(
            "alpha",
            "a@x",
            "p",
            &Schedule::Once,
            ContextMode::Isolated,
            base_time(),
        );
        db.save_task(&task).await.unwrap();
        let stale = db.get_task(&task.id).await.unwrap().unwrap();

        // A run is recorded after the caller read its copy.
        db.update_task_run(&task.id, base_time(), "done", None, TaskStatus::Completed)
            .await
            .unwrap();

        let changed = db
            .set_task_status(&stale.id, TaskStatus::Active, stale.next_run)
            .await
            .unwrap();
        assert!(!changed);
        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.next_run, None);
        assert_eq!(stored.last_result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn resume_fills_only_missing_next_run() {
        let db = test_db().await;
        let schedule: Schedule = "interval:1h".parse().unwrap();
        let mut task = ScheduledTask::new(
            "alpha",
            "a@x",
            "p",
            &schedule,
            ContextMode::Isolated,
            base_time(),
        );
        task.status = TaskStatus::Paused;
        db.save_task(&task).await.unwrap();

        let fallback = base_time() + Duration::days(1);
        assert!(
            db.set_task_status(&task.id, TaskStatus::Active, Some(fallback))
                .await
                .unwrap()
        );
        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Active);
        assert_eq!(stored.next_run, task.next_run);

        task.next_run = None;
        task.status = TaskStatus::Paused;
        db.save_task(&task).await.unwrap();
        db.set_task_status(&task.id, TaskStatus::Active, Some(fallback))
            .await
            .unwrap();
        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run, Some(fallback));
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_task_run("nope", base_time(), "x", None, TaskStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("claw.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.register_group(&group("a@x", "alpha")).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.get_registered_groups().await.unwrap().len(), 1);
    }
}
