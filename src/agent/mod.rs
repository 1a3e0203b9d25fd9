//! The downstream agent: given a group, a session, and a prompt, produce text.

pub mod openai;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::AgentError;

pub use openai::OpenAiAgent;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// The call must finish (or give up) by this instant.
    pub deadline: Instant,
    /// Group namespace; selects instructions.
    pub group_folder: String,
    /// Conversation continuity token.
    pub session_id: String,
    pub prompt: String,
}

/// Opaque request/response agent call. Never retried by the caller.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<String, AgentError>;
}
