//! Persistence layer: libSQL-backed storage for messages, groups, sessions, and tasks.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Store;
