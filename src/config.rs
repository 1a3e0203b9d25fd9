//! Configuration types, loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Folder used for conversations that are not registered as groups.
pub const MAIN_GROUP_FOLDER: &str = "main";

/// Settings for the dispatch orchestrator.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Assistant display name; the default trigger is `@<name>` at line start.
    pub assistant_name: String,
    /// Folder used when a conversation has no registered group.
    pub default_folder: String,
    /// Number of recent messages handed to the agent.
    pub history_limit: usize,
    /// Deadline for a single agent call.
    pub agent_timeout: Duration,
    /// How often the catch-up loop re-scans registered conversations.
    pub message_poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Andy".to_string(),
            default_folder: MAIN_GROUP_FOLDER.to_string(),
            history_limit: 20,
            agent_timeout: Duration::from_secs(120), // 2 minutes
            message_poll_interval: Duration::from_millis(2000),
        }
    }
}

impl DispatchConfig {
    /// Trigger pattern used when a group has none (or an invalid one).
    pub fn default_trigger(&self) -> String {
        format!(r"(?i)^@{}\b", regex::escape(&self.assistant_name))
    }
}

/// Settings for the task scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// History window for tasks that run in `group` context mode.
    pub task_history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            task_history_limit: 10,
        }
    }
}

/// Settings for the OpenAI-compatible agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    /// Root directory holding one folder per group.
    pub groups_dir: PathBuf,
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub groups_dir: PathBuf,
    /// Global cap on concurrently executing jobs. Always >= 1.
    pub max_concurrent: usize,
    pub dispatch: DispatchConfig,
    pub scheduler: SchedulerConfig,
    /// `None` when `OPENAI_API_KEY` is unset.
    pub agent: Option<AgentConfig>,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = PathBuf::from(get("CLAW_DATA_DIR").unwrap_or_else(|| "./data".to_string()));
        let db_path = get("CLAW_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("claw.db"));
        let groups_dir =
            PathBuf::from(get("CLAW_GROUPS_DIR").unwrap_or_else(|| "./groups".to_string()));

        let max_concurrent: usize = parse_or("CLAW_MAX_CONCURRENT", get("CLAW_MAX_CONCURRENT"), 5)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CLAW_MAX_CONCURRENT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            assistant_name: get("CLAW_ASSISTANT_NAME").unwrap_or(defaults.assistant_name),
            default_folder: defaults.default_folder,
            history_limit: parse_or(
                "CLAW_HISTORY_LIMIT",
                get("CLAW_HISTORY_LIMIT"),
                defaults.history_limit,
            )?,
            agent_timeout: Duration::from_secs(parse_or(
                "CLAW_AGENT_TIMEOUT_SECS",
                get("CLAW_AGENT_TIMEOUT_SECS"),
                defaults.agent_timeout.as_secs(),
            )?),
            message_poll_interval: Duration::from_millis(parse_positive(
                "CLAW_MESSAGE_POLL_MS",
                get("CLAW_MESSAGE_POLL_MS"),
                2000,
            )?),
        };

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(parse_positive(
                "CLAW_TASK_POLL_SECS",
                get("CLAW_TASK_POLL_SECS"),
                60,
            )?),
            task_history_limit: parse_or(
                "CLAW_TASK_HISTORY_LIMIT",
                get("CLAW_TASK_HISTORY_LIMIT"),
                10,
            )?,
        };

        let agent = get("OPENAI_API_KEY").map(|key| AgentConfig {
            api_key: SecretString::from(key),
            base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            groups_dir: groups_dir.clone(),
        });

        Ok(Self {
            data_dir,
            db_path,
            groups_dir,
            max_concurrent,
            dispatch,
            scheduler,
            agent,
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}

fn parse_positive(key: &str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let value = parse_or(key, raw, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
