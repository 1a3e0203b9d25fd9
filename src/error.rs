//! Error types for the dispatch engine.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced synchronously by the group dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Submission for group {key} cancelled before enqueue")]
    Cancelled { key: String },
}

/// Errors from the downstream agent call.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Invalid agent response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Agent returned an empty result")]
    EmptyResult,

    #[error("Agent call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors parsing a task's schedule specification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Unknown schedule type: {0}")]
    UnknownType(String),

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Invalid cron expression '{value}': {reason}")]
    InvalidCron { value: String, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
