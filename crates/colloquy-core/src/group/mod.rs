//! Supervisor-directed group orchestration.
//!
//! A bounded, phase-based state machine: the supervisor decides which agents
//! act next (`speak` / `broadcast` / `delegate`), pluggable executors invoke
//! them, and the runtime enforces round bounds and sequencing.

mod coordinator;
mod executors;
mod runtime;
mod supervisor;

pub use coordinator::{GroupCoordinator, GroupScope};
pub use executors::{GroupExecutor, GroupExecutors, PhaseStep};
pub use runtime::{GroupOrchestrationRuntime, OrchestrationStepOutput};
pub use supervisor::{BoundedSupervisor, FinishInvoker, OrchestrationSupervisor, SupervisorInvoker};
