//! Claw Dispatch: per-conversation FIFO dispatch, a global concurrency cap,
//! and a polling task scheduler in front of a single agent call.

pub mod agent;
pub mod config;
pub mod console;
pub mod display;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use error::{Error, Result};
