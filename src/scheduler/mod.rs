//! Scheduled tasks: schedule grammar, the persisted task model, and the
//! poll loop that dispatches due tasks.

pub mod engine;
pub mod schedule;
pub mod task;

pub use engine::{Clock, TaskScheduler, spawn_task_scheduler};
pub use schedule::{CronSchedule, Schedule, parse_duration};
pub use task::{ContextMode, ScheduleType, ScheduledTask, TaskStatus};
