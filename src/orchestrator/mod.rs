//! Dispatch orchestration: trigger checks, the shared job body, and the
//! catch-up message poll.

pub mod bootstrap;
pub mod dispatch;
pub mod prompt;

pub use bootstrap::{MAIN_CHAT_JID, ensure_main_group};
pub use dispatch::{Orchestrator, Turn, TurnInput, TurnResult, spawn_message_poller};
