//! Dispatch orchestrator.
//!
//! Turns trigger events into queued jobs and owns the job body:
//! resolve group and session, fetch history, call the agent under a
//! deadline, persist the reply (or a synthetic error), notify the display.
//!
//! Two producers feed the queue from here:
//! - **Direct submission** via [`Orchestrator::handle_incoming_message`]
//! - A **catch-up poll** over registered conversations, for messages that
//!   reached the store through some other channel

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentRequest};
use crate::config::DispatchConfig;
use crate::display::DisplaySink;
use crate::error::{AgentError, ConfigError, Error, QueueError};
use crate::model::{ChatMessage, RegisteredGroup};
use crate::orchestrator::prompt;
use crate::queue::GroupQueue;
use crate::store::Store;

/// What the agent sees for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    /// Recent conversation history, optionally followed by an instruction,
    /// in the group's shared session.
    Conversation {
        history_limit: usize,
        instruction: Option<String>,
    },
    /// A bare prompt in a dedicated session.
    Isolated { session_id: String, prompt: String },
}

/// One unit of work for the job body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Conversation the reply is posted to; also the routing key.
    pub chat_jid: String,
    /// Folder to run under. Resolved from the registered group when `None`.
    pub group_folder: Option<String>,
    pub input: TurnInput,
}

/// Result of a job body: the cleaned reply, or why the turn failed.
pub type TurnResult = Result<String, Error>;

/// Sends `thinking = true` on creation and `thinking = false` on drop.
struct ThinkingGuard<'a> {
    sink: &'a dyn DisplaySink,
    chat_jid: &'a str,
}

impl<'a> ThinkingGuard<'a> {
    fn start(sink: &'a dyn DisplaySink, chat_jid: &'a str) -> Self {
        sink.thinking_changed(chat_jid, true);
        Self { sink, chat_jid }
    }
}

impl Drop for ThinkingGuard<'_> {
    fn drop(&mut self) {
        self.sink.thinking_changed(self.chat_jid, false);
    }
}

/// Routes messages and due tasks through the group queue to the agent.
pub struct Orchestrator {
    config: DispatchConfig,
    store: Arc<dyn Store>,
    agent: Arc<dyn Agent>,
    sink: Arc<dyn DisplaySink>,
    queue: GroupQueue,
    /// Process-wide cancellation; queued jobs are dropped once it fires.
    cancel: CancellationToken,
    default_trigger: Regex,
    /// Compiled trigger patterns keyed by source pattern.
    triggers: Mutex<HashMap<String, Regex>>,
    /// Newest message timestamp already considered, per conversation.
    last_seen: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Floor for `last_seen`: history older than startup is never re-triggered.
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn Store>,
        agent: Arc<dyn Agent>,
        sink: Arc<dyn DisplaySink>,
        queue: GroupQueue,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, ConfigError> {
        let default_trigger =
            Regex::new(&config.default_trigger()).map_err(|e| ConfigError::InvalidValue {
                key: "CLAW_ASSISTANT_NAME".to_string(),
                message: e.to_string(),
            })?;

        Ok(Arc::new(Self {
            config,
            store,
            agent,
            sink,
            queue,
            cancel,
            default_trigger,
            triggers: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
        }))
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn queue(&self) -> &GroupQueue {
        &self.queue
    }

    // ── Trigger check ───────────────────────────────────────────────

    /// Persist and display an inbound message; enqueue a turn if it triggers.
    ///
    /// Returns whether a turn was submitted.
    pub async fn handle_incoming_message(
        self: &Arc<Self>,
        chat_jid: &str,
        sender: &str,
        text: &str,
    ) -> Result<bool, Error> {
        let message = ChatMessage::inbound(chat_jid, sender, text, Utc::now());

        // Mark seen before the row exists so the catch-up poll cannot pick
        // up the same message a second time.
        self.advance_last_seen(chat_jid, message.timestamp);
        self.store.save_message(&message).await?;
        self.sink.message_appended(&message);

        let group = self.lookup_group(chat_jid).await;
        if !self.is_trigger(group.as_ref(), text) {
            debug!(chat_jid, "Message stored, no trigger");
            return Ok(false);
        }

        info!(chat_jid, text = %prompt::preview(text, 60), "Trigger matched, queueing turn");
        self.submit_turn(self.conversation_turn(chat_jid), |_| std::future::ready(()))?;
        Ok(true)
    }

    /// Whether `text` should wake the assistant in this conversation.
    pub fn is_trigger(&self, group: Option<&RegisteredGroup>, text: &str) -> bool {
        match group {
            Some(group) if !group.requires_trigger => true,
            Some(group) => self.trigger_for(&group.trigger_pattern).is_match(text),
            None => self.default_trigger.is_match(text),
        }
    }

    fn trigger_for(&self, pattern: &str) -> Regex {
        if pattern.trim().is_empty() {
            return self.default_trigger.clone();
        }
        let mut cache = self.triggers.lock();
        if let Some(re) = cache.get(pattern) {
            return re.clone();
        }
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!(pattern, error = %e, "Invalid trigger pattern, using default");
                self.default_trigger.clone()
            }
        };
        cache.insert(pattern.to_string(), re.clone());
        re
    }

    async fn lookup_group(&self, chat_jid: &str) -> Option<RegisteredGroup> {
        match self.store.get_group(chat_jid).await {
            Ok(group) => group,
            Err(e) => {
                warn!(chat_jid, error = %e, "Group lookup failed");
                None
            }
        }
    }

    fn conversation_turn(&self, chat_jid: &str) -> Turn {
        Turn {
            chat_jid: chat_jid.to_string(),
            group_folder: None,
            input: TurnInput::Conversation {
                history_limit: self.config.history_limit,
                instruction: None,
            },
        }
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Queue `turn` under its conversation, then hand the outcome to `after`.
    ///
    /// Fails only if the process is already shutting down.
    pub fn submit_turn<F, Fut>(self: &Arc<Self>, turn: Turn, after: F) -> Result<(), QueueError>
    where
        F: FnOnce(TurnResult) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        let key = turn.chat_jid.clone();
        self.queue.submit(&key, &self.cancel, async move {
            let outcome = this.run_turn(turn).await;
            after(outcome).await;
        })
    }

    // ── Job body ────────────────────────────────────────────────────

    /// Run one turn to completion. Never panics on agent or store failure;
    /// failures become a visible error message in the conversation.
    pub async fn run_turn(&self, turn: Turn) -> TurnResult {
        let _thinking = ThinkingGuard::start(self.sink.as_ref(), &turn.chat_jid);

        let outcome = self.converse(&turn).await;
        let content = match &outcome {
            Ok(text) => prompt::format_outbound(text),
            Err(e) => {
                warn!(chat_jid = %turn.chat_jid, error = %e, "Turn failed");
                format!("(agent error: {e})")
            }
        };

        let reply = ChatMessage::from_assistant(
            &turn.chat_jid,
            &self.config.assistant_name,
            &content,
            Utc::now(),
        );
        if let Err(e) = self.store.save_message(&reply).await {
            error!(chat_jid = %turn.chat_jid, error = %e, "Failed to persist reply");
        }
        self.sink.message_appended(&reply);

        outcome.map(|_| content)
    }

    async fn converse(&self, turn: &Turn) -> TurnResult {
        let folder = match &turn.group_folder {
            Some(folder) => folder.clone(),
            None => self.resolve_folder(&turn.chat_jid).await,
        };

        let (session_id, prompt) = match &turn.input {
            TurnInput::Conversation {
                history_limit,
                instruction,
            } => {
                let session_id = self.store.get_or_create_session(&folder).await?;
                let history = self
                    .store
                    .get_recent_messages(&turn.chat_jid, *history_limit)
                    .await?;
                (session_id, prompt::build_prompt(&history, instruction.as_deref()))
            }
            TurnInput::Isolated { session_id, prompt } => (session_id.clone(), prompt.clone()),
        };

        let deadline = Instant::now() + self.config.agent_timeout;
        let request = AgentRequest {
            deadline,
            group_folder: folder,
            session_id,
            prompt,
        };

        debug!(chat_jid = %turn.chat_jid, folder = %request.group_folder, "Invoking agent");
        match tokio::time::timeout_at(deadline, self.agent.run(request)).await {
            Ok(Ok(text)) if text.trim().is_empty() => Err(AgentError::EmptyResult.into()),
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(AgentError::Timeout(self.config.agent_timeout).into()),
        }
    }

    async fn resolve_folder(&self, chat_jid: &str) -> String {
        match self.lookup_group(chat_jid).await {
            Some(group) => group.folder,
            None => {
                warn!(
                    chat_jid,
                    folder = %self.config.default_folder,
                    "Conversation not registered, using default folder"
                );
                self.config.default_folder.clone()
            }
        }
    }

    // ── Catch-up poll ───────────────────────────────────────────────

    fn last_seen(&self, chat_jid: &str) -> DateTime<Utc> {
        self.last_seen
            .lock()
            .get(chat_jid)
            .copied()
            .unwrap_or(self.started_at)
    }

    fn advance_last_seen(&self, chat_jid: &str, ts: DateTime<Utc>) {
        let mut seen = self.last_seen.lock();
        let entry = seen.entry(chat_jid.to_string()).or_insert(self.started_at);
        if ts > *entry {
            *entry = ts;
        }
    }

    /// Scan every registered conversation for unseen messages.
    ///
    /// Submits at most one turn per conversation per scan. Returns how many
    /// turns were submitted.
    pub async fn check_new_messages(self: &Arc<Self>) -> usize {
        let groups = match self.store.get_registered_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                error!(error = %e, "Failed to load registered groups");
                return 0;
            }
        };

        let mut submitted = 0;
        for group in groups {
            let since = self.last_seen(&group.jid);
            let messages = match self.store.get_new_messages(&group.jid, since).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(chat_jid = %group.jid, error = %e, "Failed to load new messages");
                    continue;
                }
            };
            let Some(newest) = messages.last().map(|m| m.timestamp) else {
                continue;
            };
            self.advance_last_seen(&group.jid, newest);

            for message in &messages {
                self.sink.message_appended(message);
            }

            if !messages
                .iter()
                .any(|m| self.is_trigger(Some(&group), &m.content))
            {
                continue;
            }

            match self.submit_turn(self.conversation_turn(&group.jid), |_| std::future::ready(())) {
                Ok(()) => {
                    submitted += 1;
                    info!(chat_jid = %group.jid, unseen = messages.len(), "Catch-up trigger, queueing turn");
                }
                Err(e) => debug!(chat_jid = %group.jid, error = %e, "Catch-up submission skipped"),
            }
        }
        submitted
    }
}

/// Spawn the catch-up poll loop. Stops when `cancel` fires.
pub fn spawn_message_poller(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Message poll loop started (interval: {}ms)", interval.as_millis());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    orchestrator.check_new_messages().await;
                }
            }
        }
        info!("Message poll loop stopped");
    })
}
