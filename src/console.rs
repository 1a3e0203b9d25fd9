//! Local console: plain lines are chat, slash commands manage tasks.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{DatabaseError, Error};
use crate::orchestrator::prompt::preview;
use crate::scheduler::{ContextMode, Schedule, ScheduledTask, TaskStatus};
use crate::store::Store;

pub const USAGE: &str = "\
Commands:
  /schedule <once|interval:<duration>|cron:<expr>> <prompt>
  /tasks
  /pause <task-id>
  /resume <task-id>
  /quit";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Schedule { schedule: String, prompt: String },
    Tasks,
    Pause(String),
    Resume(String),
    Quit,
    /// Unknown or malformed command; carries the hint to show.
    Usage(String),
}

impl Command {
    /// Parse a console line. Blank lines give `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Chat(line.to_string()));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let command = match (name, args) {
            ("quit" | "exit", _) => Command::Quit,
            ("tasks", _) => Command::Tasks,
            ("pause", id) if !id.is_empty() => Command::Pause(id.to_string()),
            ("resume", id) if !id.is_empty() => Command::Resume(id.to_string()),
            ("schedule", args) => match split_schedule(args) {
                Some((schedule, prompt)) => Command::Schedule { schedule, prompt },
                None => Command::Usage("usage: /schedule <schedule> <prompt>".to_string()),
            },
            ("pause" | "resume", _) => Command::Usage(format!("usage: /{name} <task-id>")),
            _ => Command::Usage(USAGE.to_string()),
        };
        Some(command)
    }
}

/// Split `/schedule` arguments into the schedule and the prompt. A cron
/// expression spans five words unless it is an `@` descriptor.
fn split_schedule(args: &str) -> Option<(String, String)> {
    let words: Vec<&str> = args.split_whitespace().collect();
    let first = *words.first()?;
    let spec_len = match first.strip_prefix("cron:") {
        Some(rest) if rest.starts_with('@') => 1,
        Some("") => 6,
        Some(_) => 5,
        None => 1,
    };
    if words.len() <= spec_len {
        return None;
    }
    Some((words[..spec_len].join(" "), words[spec_len..].join(" ")))
}

/// Create an isolated task for a conversation.
pub async fn schedule_task(
    store: &dyn Store,
    group_folder: &str,
    chat_jid: &str,
    spec: &str,
    prompt: &str,
    now: DateTime<Utc>,
) -> Result<ScheduledTask, Error> {
    let schedule: Schedule = spec.parse()?;
    let task = ScheduledTask::new(
        group_folder,
        chat_jid,
        prompt,
        &schedule,
        ContextMode::Isolated,
        now,
    );
    store.save_task(&task).await?;
    Ok(task)
}

/// Pause or resume a task. Resuming a task without a next run schedules it
/// from `now`. Completed tasks stay completed.
///
/// Only the status (and an empty `next_run`) is written, so a run recorded
/// concurrently is never overwritten.
pub async fn set_paused(
    store: &dyn Store,
    id: &str,
    paused: bool,
    now: DateTime<Utc>,
) -> Result<ScheduledTask, Error> {
    let not_found = || DatabaseError::NotFound {
        entity: "task".to_string(),
        id: id.to_string(),
    };
    let task = store.get_task(id).await?.ok_or_else(not_found)?;

    let (status, next_run_if_unset) = if paused {
        (TaskStatus::Paused, None)
    } else if task.next_run.is_none() {
        (TaskStatus::Active, task.schedule()?.first_run(now))
    } else {
        (TaskStatus::Active, None)
    };

    if !store.set_task_status(id, status, next_run_if_unset).await? {
        debug!(task_id = id, "Task already completed, status unchanged");
    }
    Ok(store.get_task(id).await?.ok_or_else(not_found)?)
}

/// One-line summary for `/tasks`.
pub fn describe_task(task: &ScheduledTask) -> String {
    let spec = match task.schedule() {
        Ok(schedule) => schedule.to_string(),
        Err(_) => format!("{}:{} (invalid)", task.schedule_type, task.schedule_value),
    };
    let next = task
        .next_run
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{} [{}] {} next={} \"{}\"",
        task.id,
        task.status,
        spec,
        next,
        preview(&task.prompt, 40)
    );
    if let Some(result) = &task.last_result {
        line.push_str(&format!(" last=\"{}\"", preview(result, 40)));
    }
    line
}
