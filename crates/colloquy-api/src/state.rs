//! Application state wiring the runtime together.
//!
//! `AppState` holds the concrete component instances used by both the CLI
//! and REST API. Core components are generic over the event-log / store /
//! planner traits; AppState pins them to the shipped implementations: the
//! durable SQLite event log, the in-memory message store, and the echo
//! provider (a real model adapter is injected by the embedding
//! application).

use std::sync::Arc;
use std::time::Duration;

use colloquy_core::driver::{
    ChatTurnPlanner, EchoProvider, ExecutionDriver, FnToolExecutor, InMemoryMessageStore,
};
use colloquy_core::operation::OperationRegistry;
use colloquy_infra::sqlite::{DatabasePool, SqliteEventLog};

/// Concrete driver type pinned to the infra implementations.
pub type ConcreteDriver =
    ExecutionDriver<SqliteEventLog, InMemoryMessageStore, FnToolExecutor, ChatTurnPlanner>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<OperationRegistry>,
    pub event_log: Arc<SqliteEventLog>,
    pub message_store: Arc<InMemoryMessageStore>,
    pub driver: Arc<ConcreteDriver>,
    /// Interval between heartbeat frames on open streams.
    pub heartbeat_interval: Duration,
    /// Most recent events fetched for a history replay.
    pub history_limit: usize,
}

impl AppState {
    /// Initialize against the default data directory
    /// (`COLLOQUY_DATA_DIR`, falling back to `~/.colloquy`).
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = std::env::var("COLLOQUY_DATA_DIR").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            format!("{home}/.colloquy")
        });
        tokio::fs::create_dir_all(&data_dir).await?;
        let db_url = format!("sqlite://{data_dir}/colloquy.db?mode=rwc");
        Self::init_with(&db_url, Duration::from_secs(15)).await
    }

    /// Initialize against an explicit database URL (tests use a tempdir).
    pub async fn init_with(db_url: &str, heartbeat_interval: Duration) -> anyhow::Result<Self> {
        let pool = DatabasePool::new(db_url).await?;
        let registry = Arc::new(OperationRegistry::new());
        let event_log = Arc::new(SqliteEventLog::new(pool));
        let message_store = Arc::new(InMemoryMessageStore::new());

        let driver = Arc::new(ExecutionDriver::new(
            registry.clone(),
            event_log.clone(),
            message_store.clone(),
            Arc::new(FnToolExecutor::new()),
            Arc::new(ChatTurnPlanner::new("echo")),
            Arc::new(EchoProvider),
        ));

        Ok(Self {
            registry,
            event_log,
            message_store,
            driver,
            heartbeat_interval,
            history_limit: 50,
        })
    }
}
