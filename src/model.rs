//! Conversation-side records: messages and registered groups.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single chat message, inbound or produced by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    pub is_bot_message: bool,
}

impl ChatMessage {
    /// A message typed by a user.
    pub fn inbound(chat_jid: &str, sender: &str, content: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_jid: chat_jid.to_string(),
            sender: sender.to_string(),
            sender_name: sender.to_string(),
            content: content.to_string(),
            timestamp,
            is_from_me: false,
            is_bot_message: false,
        }
    }

    /// A message authored by the assistant.
    pub fn from_assistant(
        chat_jid: &str,
        assistant: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_jid: chat_jid.to_string(),
            sender: assistant.to_string(),
            sender_name: assistant.to_string(),
            content: content.to_string(),
            timestamp,
            is_from_me: true,
            is_bot_message: true,
        }
    }
}

/// A conversation the assistant participates in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredGroup {
    /// Conversation identifier; also the routing key for live traffic.
    pub jid: String,
    pub name: String,
    /// Namespace for instructions and sessions. Unique across groups.
    pub folder: String,
    /// Regex a message must match to wake the assistant.
    pub trigger_pattern: String,
    /// When false, every non-bot message is treated as a trigger.
    pub requires_trigger: bool,
    pub added_at: DateTime<Utc>,
}

/// Canonical timestamp encoding for storage.
///
/// Fixed-width UTC with microseconds, so lexical order equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
