//! Scheduled task model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::scheduler::schedule::Schedule;

/// How a task's recurrence is specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Interval,
    Cron,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleType::Once => write!(f, "once"),
            ScheduleType::Interval => write!(f, "interval"),
            ScheduleType::Cron => write!(f, "cron"),
        }
    }
}

impl FromStr for ScheduleType {
    type Err = ScheduleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(ScheduleType::Once),
            "interval" => Ok(ScheduleType::Interval),
            "cron" => Ok(ScheduleType::Cron),
            other => Err(ScheduleError::UnknownType(other.to_string())),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Paused => write!(f, "paused"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Whether a task sees the live conversation or runs on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Shares history and session with the group's conversation.
    Group,
    /// Prompt only, in a task-private session.
    #[default]
    Isolated,
}

impl fmt::Display for ContextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextMode::Group => write!(f, "group"),
            ContextMode::Isolated => write!(f, "isolated"),
        }
    }
}

impl FromStr for ContextMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group" => Ok(ContextMode::Group),
            "isolated" => Ok(ContextMode::Isolated),
            other => Err(format!("unknown context mode: {other}")),
        }
    }
}

/// A persisted, time-triggered prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    /// Conversation the result is posted to; also the routing key.
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Create an active task whose first run is derived from its schedule.
    pub fn new(
        group_folder: &str,
        chat_jid: &str,
        prompt: &str,
        schedule: &Schedule,
        context_mode: ContextMode,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            group_folder: group_folder.to_string(),
            chat_jid: chat_jid.to_string(),
            prompt: prompt.to_string(),
            schedule_type: schedule.schedule_type(),
            schedule_value: schedule.value(),
            context_mode,
            next_run: schedule.first_run(now),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now,
        }
    }

    /// Active, has a next run, and that run is not in the future.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Active && self.next_run.is_some_and(|next| next <= now)
    }

    /// Parse this task's schedule specification.
    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::parse(self.schedule_type, &self.schedule_value)
    }
}
