//! Display sink: fire-and-forget notifications for whatever renders the chat.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::model::ChatMessage;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Receives conversation updates. Calls must not block.
pub trait DisplaySink: Send + Sync {
    /// A message was appended to a conversation.
    fn message_appended(&self, message: &ChatMessage);

    /// The assistant started or stopped working on a conversation.
    fn thinking_changed(&self, chat_jid: &str, thinking: bool);
}

/// Events fanned out by [`BroadcastSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    MessageAppended { message: ChatMessage },
    Thinking { chat_jid: String, thinking: bool },
}

/// Broadcast-channel sink; any number of renderers may subscribe.
pub struct BroadcastSink {
    tx: broadcast::Sender<DisplayEvent>,
}

impl BroadcastSink {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self { tx })
    }

    /// Subscribe to display events.
    pub fn subscribe(&self) -> broadcast::Receiver<DisplayEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: DisplayEvent) {
        // Ok if no renderer is listening.
        if self.tx.send(event).is_err() {
            trace!("Display event dropped: no subscribers");
        }
    }
}

impl DisplaySink for BroadcastSink {
    fn message_appended(&self, message: &ChatMessage) {
        self.publish(DisplayEvent::MessageAppended {
            message: message.clone(),
        });
    }

    fn thinking_changed(&self, chat_jid: &str, thinking: bool) {
        self.publish(DisplayEvent::Thinking {
            chat_jid: chat_jid.to_string(),
            thinking,
        });
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl DisplaySink for NullSink {
    fn message_appended(&self, _message: &ChatMessage) {}
    fn thinking_changed(&self, _chat_jid: &str, _thinking: bool) {}
}
