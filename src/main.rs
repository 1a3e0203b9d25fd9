use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use claw_dispatch::agent::OpenAiAgent;
use claw_dispatch::config::AppConfig;
use claw_dispatch::console::{self, Command};
use claw_dispatch::display::{BroadcastSink, DisplayEvent};
use claw_dispatch::orchestrator::{self, MAIN_CHAT_JID, Orchestrator};
use claw_dispatch::queue::GroupQueue;
use claw_dispatch::scheduler::{self, TaskScheduler};
use claw_dispatch::store::{LibSqlBackend, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    // Logs go to a file; stdout is the chat display.
    let file_appender = tracing_appender::rolling::daily(&config.data_dir, "claw-dispatch.log");
    let (log_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_writer)
        .init();

    let Some(agent_config) = config.agent.clone() else {
        eprintln!("Error: OPENAI_API_KEY not set");
        eprintln!("  export OPENAI_API_KEY=sk-...");
        std::process::exit(1);
    };

    eprintln!("🦀 Claw Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", agent_config.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Groups: {}", config.groups_dir.display());
    eprintln!("   Max concurrent: {}", config.max_concurrent);
    eprintln!("   Logs: {}", config.data_dir.display());

    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("opening database")?,
    );
    if orchestrator::ensure_main_group(store.as_ref(), &config.dispatch, &config.groups_dir).await? {
        eprintln!("   Registered main group ({MAIN_CHAT_JID})");
    }

    // ── Core ─────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let sink = BroadcastSink::new();
    let mut events = sink.subscribe();

    let orchestrator = Orchestrator::new(
        config.dispatch.clone(),
        Arc::clone(&store),
        Arc::new(OpenAiAgent::new(agent_config)),
        sink.clone(),
        GroupQueue::new(config.max_concurrent),
        cancel.clone(),
    )?;
    let task_scheduler = TaskScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&store),
        Arc::clone(&orchestrator),
    );

    let poller = orchestrator::spawn_message_poller(
        Arc::clone(&orchestrator),
        config.dispatch.message_poll_interval,
        cancel.child_token(),
    );
    let scheduler_loop = scheduler::spawn_task_scheduler(task_scheduler, cancel.child_token());

    // ── Display ──────────────────────────────────────────────────────────
    let display_cancel = cancel.child_token();
    let display = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = display_cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(DisplayEvent::MessageAppended { message }) if message.is_bot_message => {
                        println!("\n{}: {}\n", message.sender_name, message.content);
                        eprint!("> ");
                    }
                    Ok(DisplayEvent::MessageAppended { .. }) => {}
                    Ok(DisplayEvent::Thinking { chat_jid, thinking: true }) => {
                        eprintln!("⏳ thinking ({chat_jid})");
                    }
                    Ok(DisplayEvent::Thinking { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Display fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    // ── Shutdown on Ctrl-C ───────────────────────────────────────────────
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nShutting down...");
                cancel.cancel();
            }
        });
    }

    eprintln!("   Type a message and press Enter. /quit to exit.\n");
    eprint!("> ");

    // ── Console ──────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    break;
                }
            },
        };

        let Some(command) = Command::parse(&line) else {
            eprint!("> ");
            continue;
        };
        match command {
            Command::Quit => break,
            Command::Chat(text) => {
                if let Err(e) = orchestrator
                    .handle_incoming_message(MAIN_CHAT_JID, "user", &text)
                    .await
                {
                    eprintln!("❌ {e}");
                }
            }
            Command::Schedule { schedule, prompt } => {
                match console::schedule_task(
                    store.as_ref(),
                    &config.dispatch.default_folder,
                    MAIN_CHAT_JID,
                    &schedule,
                    &prompt,
                    Utc::now(),
                )
                .await
                {
                    Ok(task) => eprintln!("✅ Scheduled {}", console::describe_task(&task)),
                    Err(e) => eprintln!("❌ {e}"),
                }
            }
            Command::Tasks => match store.list_tasks().await {
                Ok(tasks) if tasks.is_empty() => eprintln!("No tasks."),
                Ok(tasks) => {
                    for task in &tasks {
                        eprintln!("  {}", console::describe_task(task));
                    }
                }
                Err(e) => eprintln!("❌ {e}"),
            },
            Command::Pause(id) => {
                match console::set_paused(store.as_ref(), &id, true, Utc::now()).await {
                    Ok(task) => eprintln!("⏸  {}", console::describe_task(&task)),
                    Err(e) => eprintln!("❌ {e}"),
                }
            }
            Command::Resume(id) => {
                match console::set_paused(store.as_ref(), &id, false, Utc::now()).await {
                    Ok(task) => eprintln!("▶  {}", console::describe_task(&task)),
                    Err(e) => eprintln!("❌ {e}"),
                }
            }
            Command::Usage(hint) => eprintln!("{hint}"),
        }
        eprint!("> ");
    }

    cancel.cancel();
    let _ = tokio::join!(poller, scheduler_loop, display);
    tracing::info!("Shut down");
    Ok(())
}
