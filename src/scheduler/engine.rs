//! Task scheduler.
//!
//! Polls the store for due tasks on a fixed interval and submits each one
//! through the orchestrator, keyed by the task's conversation so it shares
//! the FIFO with live traffic. When a run finishes, the outcome and the
//! next run time are written back.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::orchestrator::prompt::preview;
use crate::orchestrator::{Orchestrator, Turn, TurnInput, TurnResult};
use crate::scheduler::schedule::Schedule;
use crate::scheduler::task::{ContextMode, ScheduledTask, TaskStatus};
use crate::store::Store;

/// Source of "now". Injected so recurrence arithmetic is testable.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Discovers due tasks and feeds them through the dispatch queue.
pub struct TaskScheduler {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    clock: Clock,
    /// Task ids queued or running. A task is never submitted twice at once.
    /// Ids of jobs discarded at shutdown stay here until the process exits.
    in_flight: Mutex<HashSet<String>>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        orchestrator: Arc<Orchestrator>,
    ) -> Arc<Self> {
        Self::with_clock(config, store, orchestrator, Arc::new(Utc::now))
    }

    pub fn with_clock(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        orchestrator: Arc<Orchestrator>,
        clock: Clock,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            orchestrator,
            clock,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// One poll cycle. Returns how many tasks were submitted.
    pub async fn poll_once(self: &Arc<Self>) -> usize {
        let tasks = match self.store.get_active_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to load active tasks");
                return 0;
            }
        };

        let now = (self.clock)();
        let mut submitted = 0;
        for task in tasks.into_iter().filter(|t| t.is_due(now)) {
            if !self.in_flight.lock().insert(task.id.clone()) {
                debug!(task_id = %task.id, "Task still in flight, skipping");
                continue;
            }

            let task_id = task.id.clone();
            match self.submit(task, now) {
                Ok(()) => submitted += 1,
                Err(e) => {
                    self.in_flight.lock().remove(&task_id);
                    debug!(task_id = %task_id, error = %e, "Task submission skipped");
                }
            }
        }

        if submitted > 0 {
            info!(submitted, "Scheduled tasks dispatched");
        }
        submitted
    }

    fn submit(
        self: &Arc<Self>,
        task: ScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<(), crate::error::QueueError> {
        let turn = self.turn_for(&task);
        let this = Arc::clone(self);
        info!(
            task_id = %task.id,
            chat_jid = %task.chat_jid,
            prompt = %preview(&task.prompt, 60),
            "Dispatching scheduled task"
        );
        self.orchestrator
            .submit_turn(turn, move |outcome| async move {
                this.record_run(&task, now, outcome).await;
            })
    }

    fn turn_for(&self, task: &ScheduledTask) -> Turn {
        let input = match task.context_mode {
            ContextMode::Group => TurnInput::Conversation {
                history_limit: self.config.task_history_limit,
                instruction: Some(task.prompt.clone()),
            },
            ContextMode::Isolated => TurnInput::Isolated {
                session_id: format!("task-{}", task.id),
                prompt: task.prompt.clone(),
            },
        };
        Turn {
            chat_jid: task.chat_jid.clone(),
            group_folder: Some(task.group_folder.clone()),
            input,
        }
    }

    async fn record_run(&self, task: &ScheduledTask, ran_at: DateTime<Utc>, outcome: TurnResult) {
        let last_result = match &outcome {
            Ok(text) => text.clone(),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Scheduled task run failed");
                format!("error: {e}")
            }
        };
        let (next_run, status) = next_state(task, ran_at);

        if let Err(e) = self
            .store
            .update_task_run(&task.id, ran_at, &last_result, next_run, status)
            .await
        {
            error!(task_id = %task.id, error = %e, "Failed to record task run");
        }
        self.in_flight.lock().remove(&task.id);

        debug!(
            task_id = %task.id,
            status = %status,
            next_run = ?next_run,
            "Task run recorded"
        );
    }
}

/// Next run and status for a task that ran at `now`.
///
/// `once` completes regardless of outcome. Recurring tasks always get a new
/// `next_run` unless their schedule cannot be parsed or has no future
/// occurrence; then they stay active without one, and the error is logged.
pub fn next_state(task: &ScheduledTask, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, TaskStatus) {
    match task.schedule() {
        Ok(Schedule::Once) => (None, TaskStatus::Completed),
        Ok(schedule) => match schedule.next_after(now) {
            Some(next) => (Some(next), TaskStatus::Active),
            None => {
                error!(
                    task_id = %task.id,
                    schedule = %schedule,
                    "Schedule has no upcoming run; task stalled"
                );
                (None, TaskStatus::Active)
            }
        },
        Err(e) => {
            error!(
                task_id = %task.id,
                error = %e,
                "Invalid schedule; task stalled until corrected"
            );
            (None, TaskStatus::Active)
        }
    }
}

/// Spawn the scheduler poll loop. The first poll runs immediately so tasks
/// that came due while the process was down are not delayed a full interval.
pub fn spawn_task_scheduler(
    scheduler: Arc<TaskScheduler>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = scheduler.config.poll_interval;
        info!("Task scheduler started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    scheduler.poll_once().await;
                }
            }
        }
        info!("Task scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tokio::sync::Notify;

    use super::*;
    use crate::agent::{Agent, AgentRequest};
    use crate::config::DispatchConfig;
    use crate::console;
    use crate::display::NullSink;
    use crate::error::AgentError;
    use crate::model::{ChatMessage, RegisteredGroup};
    use crate::queue::GroupQueue;
    use crate::scheduler::task::ScheduleType;
    use crate::store::LibSqlBackend;

    struct StubAgent {
        fail: bool,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
        requests: Mutex<Vec<AgentRequest>>,
    }

    impl StubAgent {
        fn new(fail: bool, gate: Option<Arc<Notify>>) -> Arc<Self> {
            Arc::new(Self {
                fail,
                gate,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        async fn run(&self, request: AgentRequest) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                Err(AgentError::RequestFailed {
                    reason: "model unavailable".to_string(),
                })
            } else {
                Ok("task output".to_string())
            }
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 2, 0).unwrap()
    }

    struct Harness {
        scheduler: Arc<TaskScheduler>,
        store: Arc<LibSqlBackend>,
        agent: Arc<StubAgent>,
    }

    async fn harness(agent: Arc<StubAgent>) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let orchestrator = Orchestrator::new(
            DispatchConfig::default(),
            store.clone(),
            agent.clone(),
            Arc::new(NullSink),
            GroupQueue::new(2),
            CancellationToken::new(),
        )
        .unwrap();
        let now = t0();
        let scheduler = TaskScheduler::with_clock(
            SchedulerConfig::default(),
            store.clone(),
            orchestrator,
            Arc::new(move || now),
        );
        Harness {
            scheduler,
            store,
            agent,
        }
    }

    async fn save(
        h: &Harness,
        schedule_type: ScheduleType,
        value: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> ScheduledTask {
        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            group_folder: "family".to_string(),
            chat_jid: "family@x".to_string(),
            prompt: "summarize the day".to_string(),
            schedule_type,
            schedule_value: value.to_string(),
            context_mode: ContextMode::Isolated,
            next_run,
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: t0() - ChronoDuration::days(1),
        };
        h.store.save_task(&task).await.unwrap();
        task
    }

    async fn wait_for_run(h: &Harness, id: &str) -> ScheduledTask {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = h.store.get_task(id).await.unwrap().unwrap();
                if task.last_run.is_some() && !h.scheduler.in_flight.lock().contains(id) {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task never recorded a run")
    }

    #[tokio::test]
    async fn once_task_runs_exactly_once() {
        let h = harness(StubAgent::new(false, None)).await;
        let task = save(&h, ScheduleType::Once, "", Some(t0() - ChronoDuration::minutes(1))).await;

        assert_eq!(h.scheduler.poll_once().await, 1);
        let stored = wait_for_run(&h, &task.id).await;

        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.last_result.as_deref(), Some("task output"));
        assert_eq!(stored.last_run, Some(t0()));
        assert_eq!(stored.next_run, None);

        assert_eq!(h.scheduler.poll_once().await, 0);
        assert_eq!(h.agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interval_task_reschedules_from_poll_time() {
        let h = harness(StubAgent::new(false, None)).await;
        let task = save(&h, ScheduleType::Interval, "1h", Some(t0())).await;

        assert_eq!(h.scheduler.poll_once().await, 1);
        let stored = wait_for_run(&h, &task.id).await;

        assert_eq!(stored.status, TaskStatus::Active);
        assert_eq!(stored.next_run, Some(t0() + ChronoDuration::hours(1)));
    }

    #[tokio::test]
    async fn future_and_paused_tasks_are_not_dispatched() {
        let h = harness(StubAgent::new(false, None)).await;
        save(&h, ScheduleType::Once, "", Some(t0() + ChronoDuration::seconds(1))).await;
        let mut paused = save(&h, ScheduleType::Once, "", Some(t0() - ChronoDuration::hours(1))).await;
        paused.status = TaskStatus::Paused;
        h.store.save_task(&paused).await.unwrap();
        save(&h, ScheduleType::Interval, "1h", None).await;

        assert_eq!(h.scheduler.poll_once().await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.agent.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_run_still_recurs() {
        let h = harness(StubAgent::new(true, None)).await;
        let task = save(&h, ScheduleType::Cron, "*/5 * * * *", Some(t0())).await;

        h.scheduler.poll_once().await;
        let stored = wait_for_run(&h, &task.id).await;

        assert_eq!(stored.status, TaskStatus::Active);
        assert_eq!(stored.next_run, Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 5, 0).unwrap()));
        let result = stored.last_result.unwrap();
        assert!(result.starts_with("error: "), "unexpected result {result}");
        assert!(result.contains("model unavailable"));
    }

    #[tokio::test]
    async fn failed_once_task_still_completes() {
        let h = harness(StubAgent::new(true, None)).await;
        let task = save(&h, ScheduleType::Once, "", Some(t0())).await;

        h.scheduler.poll_once().await;
        let stored = wait_for_run(&h, &task.id).await;
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.last_result.unwrap().starts_with("error: "));
    }

    #[tokio::test]
    async fn unparsable_schedule_stalls_but_stays_active() {
        let h = harness(StubAgent::new(false, None)).await;
        let task = save(&h, ScheduleType::Interval, "every so often", Some(t0())).await;

        h.scheduler.poll_once().await;
        let stored = wait_for_run(&h, &task.id).await;

        assert_eq!(stored.status, TaskStatus::Active);
        assert_eq!(stored.next_run, None);
        assert_eq!(stored.last_result.as_deref(), Some("task output"));
        assert_eq!(h.scheduler.poll_once().await, 0);
    }

    #[tokio::test]
    async fn task_in_flight_is_not_resubmitted() {
        let gate = Arc::new(Notify::new());
        let h = harness(StubAgent::new(false, Some(gate.clone()))).await;
        let task = save(&h, ScheduleType::Once, "", Some(t0())).await;

        assert_eq!(h.scheduler.poll_once().await, 1);
        assert_eq!(h.scheduler.poll_once().await, 0);

        gate.notify_one();
        let stored = wait_for_run(&h, &task.id).await;
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(h.agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pause_during_run_survives_write_back() {
        let gate = Arc::new(Notify::new());
        let h = harness(StubAgent::new(false, Some(gate.clone()))).await;
        let task = save(&h, ScheduleType::Interval, "1h", Some(t0())).await;

        assert_eq!(h.scheduler.poll_once().await, 1);
        console::set_paused(h.store.as_ref(), &task.id, true, t0())
            .await
            .unwrap();

        gate.notify_one();
        let stored = wait_for_run(&h, &task.id).await;
        assert_eq!(stored.status, TaskStatus::Paused);
        assert_eq!(stored.last_result.as_deref(), Some("task output"));
        assert_eq!(stored.next_run, Some(t0() + ChronoDuration::hours(1)));

        assert_eq!(h.scheduler.poll_once().await, 0);
        assert_eq!(h.agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn group_context_sees_history_in_group_session() {
        let h = harness(StubAgent::new(false, None)).await;
        h.store
            .register_group(&RegisteredGroup {
                jid: "family@x".to_string(),
                name: "Family".to_string(),
                folder: "family".to_string(),
                trigger_pattern: String::new(),
                requires_trigger: true,
                added_at: t0(),
            })
            .await
            .unwrap();
        h.store
            .save_message(&ChatMessage::inbound("family@x", "alice", "dinner at 7", t0()))
            .await
            .unwrap();

        let mut task = save(&h, ScheduleType::Once, "", Some(t0())).await;
        task.context_mode = ContextMode::Group;
        h.store.save_task(&task).await.unwrap();

        h.scheduler.poll_once().await;
        wait_for_run(&h, &task.id).await;

        let request = h.agent.requests.lock()[0].clone();
        assert!(request.session_id.starts_with("family-"));
        assert!(request.prompt.contains("dinner at 7"));
        assert!(request.prompt.contains("summarize the day"));
    }

    #[tokio::test]
    async fn isolated_context_uses_task_session() {
        let h = harness(StubAgent::new(false, None)).await;
        let task = save(&h, ScheduleType::Once, "", Some(t0())).await;

        h.scheduler.poll_once().await;
        wait_for_run(&h, &task.id).await;

        let request = h.agent.requests.lock()[0].clone();
        assert_eq!(request.session_id, format!("task-{}", task.id));
        assert_eq!(request.prompt, "summarize the day");
        assert_eq!(request.group_folder, "family");
    }

    #[tokio::test]
    async fn scheduler_loop_stops_on_cancel() {
        let h = harness(StubAgent::new(false, None)).await;
        let cancel = CancellationToken::new();
        let handle = spawn_task_scheduler(h.scheduler.clone(), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
