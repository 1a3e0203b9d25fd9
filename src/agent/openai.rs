//! OpenAI-compatible chat-completions agent.
//!
//! Instructions come from `<groups_dir>/<folder>/AGENT.md` when present.
//! The session id is forwarded as the request's `user` field.

use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentRequest};
use crate::config::AgentConfig;
use crate::error::AgentError;

/// Instruction file looked up inside each group folder.
pub const INSTRUCTIONS_FILE: &str = "AGENT.md";

const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful assistant in a group chat. Reply concisely to the latest message.";

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Agent backed by any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiAgent {
    config: AgentConfig,
    client: reqwest::Client,
}

impl OpenAiAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn instructions_path(&self, group_folder: &str) -> Option<PathBuf> {
        let safe = !group_folder.is_empty()
            && !group_folder.contains(['/', '\\'])
            && group_folder != "."
            && group_folder != "..";
        if !safe {
            warn!(folder = group_folder, "Refusing to read instructions for unsafe folder name");
            return None;
        }
        Some(self.config.groups_dir.join(group_folder).join(INSTRUCTIONS_FILE))
    }

    async fn instructions(&self, group_folder: &str) -> String {
        let Some(path) = self.instructions_path(group_folder) else {
            return DEFAULT_INSTRUCTIONS.to_string();
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => DEFAULT_INSTRUCTIONS.to_string(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No group instructions, using default");
                DEFAULT_INSTRUCTIONS.to_string()
            }
        }
    }
}

#[async_trait]
impl Agent for OpenAiAgent {
    async fn run(&self, request: AgentRequest) -> Result<String, AgentError> {
        let remaining = request.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AgentError::Timeout(remaining));
        }

        let system = self.instructions(&request.group_folder).await;
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": request.prompt },
            ],
            "user": request.session_id,
        });

        debug!(
            folder = %request.group_folder,
            session = %request.session_id,
            model = %self.config.model,
            "Calling agent"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .timeout(remaining)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(remaining)
                } else {
                    AgentError::RequestFailed {
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::RequestFailed {
                reason: format!("HTTP {status}: {}", text.trim()),
            });
        }

        let parsed: CompletionResponse =
            response.json().await.map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(remaining)
                } else {
                    AgentError::InvalidResponse {
                        reason: e.to_string(),
                    }
                }
            })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AgentError::EmptyResult);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn agent_for(server: &MockServer, groups_dir: PathBuf) -> OpenAiAgent {
        OpenAiAgent::new(AgentConfig {
            api_key: SecretString::from("sk-test"),
            base_url: server.uri(),
            model: "test-model".to_string(),
            groups_dir,
        })
    }

    fn request(folder: &str, prompt: &str) -> AgentRequest {
        AgentRequest {
            deadline: Instant::now() + Duration::from_secs(5),
            group_folder: folder.to_string(),
            session_id: "main-abc".to_string(),
            prompt: prompt.to_string(),
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        })
    }

    #[tokio::test]
    async fn returns_completion_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("pong")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let agent = agent_for(&server, dir.path().to_path_buf());
        let reply = agent.run(request("main", "ping")).await.unwrap();
        assert_eq!(reply, "pong");
    }

    #[tokio::test]
    async fn sends_group_instructions_and_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("family")).unwrap();
        std::fs::write(dir.path().join("family").join(INSTRUCTIONS_FILE), "Be terse.").unwrap();

        let agent = agent_for(&server, dir.path().to_path_buf());
        agent.run(request("family", "hi")).await.unwrap();
        agent.run(request("unknown", "hi")).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let first: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(first["messages"][0]["content"], "Be terse.");
        assert_eq!(first["messages"][1]["content"], "hi");
        assert_eq!(first["user"], "main-abc");
        assert_eq!(first["model"], "test-model");

        let second: serde_json::Value = serde_json::from_slice(&received[1].body).unwrap();
        assert_eq!(second["messages"][0]["content"], DEFAULT_INSTRUCTIONS);
    }

    #[tokio::test]
    async fn http_error_is_request_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let agent = agent_for(&server, PathBuf::from("/nonexistent"));
        let err = agent.run(request("main", "ping")).await.unwrap_err();
        assert!(matches!(err, AgentError::RequestFailed { reason } if reason.contains("500")));
    }

    #[tokio::test]
    async fn empty_completion_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("   ")))
            .mount(&server)
            .await;

        let agent = agent_for(&server, PathBuf::from("/nonexistent"));
        let err = agent.run(request("main", "ping")).await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyResult));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("late"))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let agent = agent_for(&server, PathBuf::from("/nonexistent"));
        let mut req = request("main", "ping");
        req.deadline = Instant::now() + Duration::from_millis(100);
        let err = agent.run(req).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[tokio::test]
    async fn expired_deadline_fails_fast() {
        let server = MockServer::start().await;
        let agent = agent_for(&server, PathBuf::from("/nonexistent"));
        let mut req = request("main", "ping");
        req.deadline = Instant::now();
        let err = agent.run(req).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn traversal_folders_are_refused() {
        let agent = OpenAiAgent::new(AgentConfig {
            api_key: SecretString::from("k"),
            base_url: "http://localhost".to_string(),
            model: "m".to_string(),
            groups_dir: PathBuf::from("/groups"),
        });
        assert!(agent.instructions_path("../etc").is_none());
        assert!(agent.instructions_path("..").is_none());
        assert_eq!(
            agent.instructions_path("main"),
            Some(PathBuf::from("/groups/main/AGENT.md"))
        );
    }
}
