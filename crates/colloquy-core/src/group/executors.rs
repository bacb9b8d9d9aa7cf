//! Pluggable phase executors.
//!
//! Executors carry out the actual per-agent invocation for a phase; the
//! runtime never talks to agents directly. Methods return boxed futures so
//! the registry can hold `Box<dyn GroupExecutor>` per phase.

use std::future::Future;
use std::pin::Pin;

use colloquy_types::error::OrchestrationError;
use colloquy_types::event::NewStreamEvent;
use colloquy_types::orchestration::{
    GroupPhasePayload, OrchestrationPhase, OrchestrationState, PhaseOutcome,
};

/// What a phase execution produced: events for the session log and the
/// outcome fed to the supervisor.
#[derive(Debug)]
pub struct PhaseStep {
    pub events: Vec<NewStreamEvent>,
    pub outcome: PhaseOutcome,
}

/// Executes one orchestration phase.
pub trait GroupExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        payload: &'a GroupPhasePayload,
        state: &'a OrchestrationState,
    ) -> Pin<Box<dyn Future<Output = Result<PhaseStep, OrchestrationError>> + Send + 'a>>;
}

/// Per-phase executor registry. A phase without a registered executor fails
/// the step with `ExecutorMissing`.
#[derive(Default)]
pub struct GroupExecutors {
    speak: Option<Box<dyn GroupExecutor>>,
    broadcast: Option<Box<dyn GroupExecutor>>,
    delegate: Option<Box<dyn GroupExecutor>>,
}

impl GroupExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_speak(mut self, executor: impl GroupExecutor + 'static) -> Self {
        self.speak = Some(Box::new(executor));
        self
    }

    pub fn with_broadcast(mut self, executor: impl GroupExecutor + 'static) -> Self {
        self.broadcast = Some(Box::new(executor));
        self
    }

    pub fn with_delegate(mut self, executor: impl GroupExecutor + 'static) -> Self {
        self.delegate = Some(Box::new(executor));
        self
    }

    /// Resolve the executor for a phase.
    pub fn resolve(&self, phase: OrchestrationPhase) -> Result<&dyn GroupExecutor, OrchestrationError> {
        let slot = match phase {
            OrchestrationPhase::Speak => &self.speak,
            OrchestrationPhase::Broadcast => &self.broadcast,
            OrchestrationPhase::Delegate => &self.delegate,
        };
        slot.as_deref()
            .ok_or_else(|| OrchestrationError::ExecutorMissing(phase.to_string()))
    }
}
