//! Backend-agnostic `Store` trait used by the orchestrator and scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::model::{ChatMessage, RegisteredGroup};
use crate::scheduler::task::{ScheduledTask, TaskStatus};

/// Persistence for messages, groups, sessions, and scheduled tasks.
///
/// Each call is independently consistent; callers never rely on a
/// transaction spanning several calls.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Messages ────────────────────────────────────────────────────

    /// Persist a message. Saving an existing id is a no-op.
    async fn save_message(&self, message: &ChatMessage) -> Result<(), DatabaseError>;

    /// The newest `limit` messages of a conversation, oldest first.
    async fn get_recent_messages(
        &self,
        chat_jid: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, DatabaseError>;

    /// Non-assistant messages strictly newer than `since`, oldest first.
    async fn get_new_messages(
        &self,
        chat_jid: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, DatabaseError>;

    // ── Groups ──────────────────────────────────────────────────────

    /// Insert or replace a registered group.
    async fn register_group(&self, group: &RegisteredGroup) -> Result<(), DatabaseError>;

    async fn get_registered_groups(&self) -> Result<Vec<RegisteredGroup>, DatabaseError>;

    async fn get_group(&self, jid: &str) -> Result<Option<RegisteredGroup>, DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Session token for a group folder, created on first use.
    async fn get_or_create_session(&self, group_folder: &str) -> Result<String, DatabaseError>;

    // ── Scheduled tasks ─────────────────────────────────────────────

    /// Insert or replace a task.
    async fn save_task(&self, task: &ScheduledTask) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, DatabaseError>;

    /// Every task regardless of status, newest first.
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError>;

    /// Tasks with `status = active`.
    async fn get_active_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError>;

    /// Record the outcome of a run and the task's next state.
    ///
    /// A task paused while its run was in flight stays paused; only a
    /// terminal `completed` overrides it.
    async fn update_task_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        last_result: &str,
        next_run: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> Result<(), DatabaseError>;

    /// Set a task's status in place, filling `next_run` with
    /// `next_run_if_unset` when it is empty. Completed tasks are left
    /// untouched. Returns whether a row changed.
    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        next_run_if_unset: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;
}
