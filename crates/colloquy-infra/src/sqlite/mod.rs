//! SQLite-backed persistence.

pub mod event_log;
pub mod pool;

pub use event_log::SqliteEventLog;
pub use pool::DatabasePool;
