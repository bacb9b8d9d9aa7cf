//! Registry of in-flight operations.
//!
//! `OperationRegistry` is the single owner of operation state. All mutation
//! goes through its transition methods; callers never hold `&mut Operation`.
//! Status transitions are monotone and terminal-exclusive: the first of
//! cancel/complete/fail wins, later calls are silently ignored (never an
//! error, even under concurrent invocation -- dashmap entry locking makes
//! each transition atomic).
//!
//! Cancellation tokens form a tree: a child operation's token is derived
//! from its parent's, so cancelling a parent aborts all in-flight child work
//! even before the explicit status cascade runs.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use colloquy_types::error::OperationFailure;
use colloquy_types::operation::{
    MetadataPatch, Operation, OperationCancelContext, OperationContext, OperationFilter,
    OperationHandle, OperationMetadata, OperationStatus, OperationType, new_operation_id,
};

type CancelHandler = Box<dyn FnOnce(OperationCancelContext) + Send + Sync>;

/// Parameters for `start_operation`.
#[derive(Debug, Clone, Default)]
pub struct StartOperation {
    pub op_type: Option<OperationType>,
    pub context: OperationContext,
    pub label: Option<String>,
    pub parent_operation_id: Option<String>,
}

impl StartOperation {
    pub fn new(op_type: OperationType) -> Self {
        Self {
            op_type: Some(op_type),
            ..Default::default()
        }
    }

    pub fn context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn parent(mut self, parent_operation_id: impl Into<String>) -> Self {
        self.parent_operation_id = Some(parent_operation_id.into());
        self
    }
}

/// Arena of live operations keyed by id, with message and parent/child
/// associations kept as id lookups (no object back-references).
#[derive(Default)]
pub struct OperationRegistry {
    operations: DashMap<String, Operation>,
    by_message: DashMap<String, Vec<String>>,
    cancel_handlers: DashMap<String, Vec<CancelHandler>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation with status `Running`.
    ///
    /// When a parent is given, the context is inherited from it (fields set
    /// in `params.context` win), the cancellation token is derived from the
    /// parent's, and the parent's child list is updated.
    pub fn start_operation(&self, params: StartOperation) -> OperationHandle {
        let operation_id = new_operation_id();
        let op_type = params.op_type.unwrap_or(OperationType::ExecAgentRuntime);

        let (context, cancellation) = match params
            .parent_operation_id
            .as_deref()
            .and_then(|id| self.operations.get(id))
        {
            Some(parent) => (
                parent.context.merged_with(&params.context),
                parent.cancellation.child_token(),
            ),
            None => (params.context, CancellationToken::new()),
        };

        let operation = Operation {
            id: operation_id.clone(),
            op_type,
            status: OperationStatus::Running,
            context: context.clone(),
            metadata: OperationMetadata {
                start_time: Utc::now(),
                ..Default::default()
            },
            label: params.label,
            parent_operation_id: params.parent_operation_id.clone(),
            child_operation_ids: Vec::new(),
            cancellation: cancellation.clone(),
        };

        debug!(operation_id = %operation_id, op_type = %op_type, "operation started");
        self.operations.insert(operation_id.clone(), operation);

        if let Some(parent_id) = &params.parent_operation_id {
            if let Some(mut parent) = self.operations.get_mut(parent_id) {
                parent.child_operation_ids.push(operation_id.clone());
            }
        }

        if let Some(message_id) = &context.message_id {
            self.associate_message(message_id, &operation_id);
        }

        // Sweep old finished operations on top-level starts only.
        if params.parent_operation_id.is_none() {
            self.cleanup_finished(Duration::seconds(30));
        }

        OperationHandle {
            operation_id,
            cancellation,
        }
    }

    /// Snapshot of an operation (status, context, metadata) by id.
    pub fn get(&self, operation_id: &str) -> Option<Operation> {
        self.operations.get(operation_id).map(|op| op.clone())
    }

    /// The cancellation token for an operation, if it is known.
    pub fn cancellation(&self, operation_id: &str) -> Option<CancellationToken> {
        self.operations
            .get(operation_id)
            .map(|op| op.cancellation.clone())
    }

    /// Register a cleanup callback invoked exactly once when the operation
    /// transitions to `Cancelled`. If the operation is already cancelled the
    /// handler runs immediately; if the operation finalizes any other way it
    /// is dropped unrun.
    pub fn on_operation_cancel<F>(&self, operation_id: &str, handler: F)
    where
        F: FnOnce(OperationCancelContext) + Send + Sync + 'static,
    {
        let Some(op) = self.operations.get(operation_id) else {
            warn!(operation_id, "cancel handler registered for unknown operation");
            return;
        };

        if op.status == OperationStatus::Cancelled {
            let context = OperationCancelContext {
                operation_id: operation_id.to_string(),
                op_type: op.op_type,
                reason: op
                    .metadata
                    .cancel_reason
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string()),
            };
            drop(op);
            handler(context);
            return;
        }
        drop(op);

        self.cancel_handlers
            .entry(operation_id.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Cancel an operation: trigger its token, run registered handlers, set
    /// status `Cancelled`, and cascade to children. Idempotent -- cancelling
    /// a finalized operation is a no-op.
    pub fn cancel_operation(&self, operation_id: &str, reason: &str) {
        let cascade = {
            let Some(mut op) = self.operations.get_mut(operation_id) else {
                debug!(operation_id, "cancel requested for unknown operation");
                return;
            };
            if op.status.is_terminal() {
                debug!(operation_id, status = %op.status, "cancel skipped, already terminal");
                return;
            }

            let now = Utc::now();
            op.status = OperationStatus::Cancelled;
            op.metadata.is_aborting = Some(true);
            op.metadata.end_time = Some(now);
            op.metadata.duration_ms =
                Some((now - op.metadata.start_time).num_milliseconds().max(0) as u64);
            op.metadata.cancel_reason = Some(reason.to_string());

            (
                op.cancellation.clone(),
                op.op_type,
                op.child_operation_ids.clone(),
            )
        };
        let (token, op_type, children) = cascade;

        debug!(operation_id, reason, "operation cancelled");

        // Abort in-flight work first so streams stop promptly.
        token.cancel();

        if let Some((_, handlers)) = self.cancel_handlers.remove(operation_id) {
            let count = handlers.len();
            for handler in handlers {
                handler(OperationCancelContext {
                    operation_id: operation_id.to_string(),
                    op_type,
                    reason: reason.to_string(),
                });
            }
            debug!(operation_id, count, "cancel handlers ran");
        }

        for child_id in children {
            self.cancel_operation(&child_id, "parent operation cancelled");
        }
    }

    /// Finalize an operation as `Completed`. No-op if already terminal.
    pub fn complete_operation(&self, operation_id: &str) {
        let Some(mut op) = self.operations.get_mut(operation_id) else {
            return;
        };
        if op.status.is_terminal() {
            return;
        }

        let now = Utc::now();
        op.status = OperationStatus::Completed;
        op.metadata.end_time = Some(now);
        op.metadata.duration_ms =
            Some((now - op.metadata.start_time).num_milliseconds().max(0) as u64);
        debug!(operation_id, duration_ms = op.metadata.duration_ms, "operation completed");
    }

    /// Finalize an operation as `Failed` with a typed failure. No-op if
    /// already terminal -- in particular a failure never overwrites a
    /// cancellation.
    pub fn fail_operation(&self, operation_id: &str, failure: OperationFailure) {
        let Some(mut op) = self.operations.get_mut(operation_id) else {
            return;
        };
        if op.status.is_terminal() {
            debug!(operation_id, status = %op.status, "fail skipped, already terminal");
            return;
        }

        let now = Utc::now();
        op.status = OperationStatus::Failed;
        op.metadata.end_time = Some(now);
        op.metadata.duration_ms =
            Some((now - op.metadata.start_time).num_milliseconds().max(0) as u64);
        warn!(operation_id, error = %failure, "operation failed");
        op.metadata.error = Some(failure);
    }

    /// Merge a partial patch into the operation's metadata.
    pub fn update_metadata(&self, operation_id: &str, patch: MetadataPatch) {
        if let Some(mut op) = self.operations.get_mut(operation_id) {
            op.metadata.apply(patch);
        }
    }

    /// Move a non-terminal operation to a non-terminal status
    /// (`Pending`/`Running`). Terminal transitions go through
    /// cancel/complete/fail only.
    pub fn update_status(&self, operation_id: &str, status: OperationStatus) {
        if status.is_terminal() {
            warn!(operation_id, %status, "terminal status change ignored, use the transition methods");
            return;
        }
        if let Some(mut op) = self.operations.get_mut(operation_id) {
            if !op.status.is_terminal() {
                op.status = status;
            }
        }
    }

    /// Associate a message with an operation for fan-out lookup. One message
    /// may be associated with several operations (e.g. an execution and its
    /// child stream).
    pub fn associate_message(&self, message_id: &str, operation_id: &str) {
        let mut ids = self.by_message.entry(message_id.to_string()).or_default();
        if !ids.iter().any(|id| id == operation_id) {
            ids.push(operation_id.to_string());
        }
    }

    /// All operations associated with a message.
    pub fn operations_for_message(&self, message_id: &str) -> Vec<String> {
        self.by_message
            .get(message_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Cancel every operation associated with a message (cascading in turn to
    /// their children).
    pub fn cancel_operations_for_message(&self, message_id: &str, reason: &str) {
        for operation_id in self.operations_for_message(message_id) {
            self.cancel_operation(&operation_id, reason);
        }
    }

    /// Cancel every running operation matched by the filter. Returns the
    /// matched ids.
    pub fn cancel_operations(&self, filter: &OperationFilter, reason: &str) -> Vec<String> {
        let matched: Vec<String> = self
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Running && Self::matches(op.value(), filter))
            .map(|op| op.id.clone())
            .collect();

        for id in &matched {
            self.cancel_operation(id, reason);
        }
        matched
    }

    /// Cancel every running operation.
    pub fn cancel_all(&self, reason: &str) {
        let running: Vec<String> = self
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Running)
            .map(|op| op.id.clone())
            .collect();
        for id in running {
            self.cancel_operation(&id, reason);
        }
    }

    /// Remove finalized operations older than `max_age`, keeping all indices
    /// consistent. Returns the number removed.
    pub fn cleanup_finished(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let stale: Vec<(String, Option<String>, Option<String>)> = self
            .operations
            .iter()
            .filter(|op| {
                op.status.is_terminal()
                    && op
                        .metadata
                        .end_time
                        .is_some_and(|end| now - end > max_age)
            })
            .map(|op| {
                (
                    op.id.clone(),
                    op.parent_operation_id.clone(),
                    op.context.message_id.clone(),
                )
            })
            .collect();

        for (id, parent_id, message_id) in &stale {
            self.operations.remove(id);
            self.cancel_handlers.remove(id);

            if let Some(parent_id) = parent_id {
                if let Some(mut parent) = self.operations.get_mut(parent_id) {
                    parent.child_operation_ids.retain(|child| child != id);
                }
            }

            if let Some(message_id) = message_id {
                if let Some(mut ids) = self.by_message.get_mut(message_id) {
                    ids.retain(|op_id| op_id != id);
                }
            }
        }

        if !stale.is_empty() {
            debug!(count = stale.len(), "finished operations cleaned up");
        }
        stale.len()
    }

    /// Number of operations currently in the registry (any status).
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn matches(op: &Operation, filter: &OperationFilter) -> bool {
        if filter.op_type.is_some_and(|t| t != op.op_type) {
            return false;
        }
        let ctx = &op.context;
        let field_matches = |want: &Option<String>, have: &Option<String>| {
            want.as_ref().is_none_or(|w| have.as_deref() == Some(w))
        };
        field_matches(&filter.session_id, &ctx.session_id)
            && field_matches(&filter.topic_id, &ctx.topic_id)
            && field_matches(&filter.thread_id, &ctx.thread_id)
            && field_matches(&filter.group_id, &ctx.group_id)
            && field_matches(&filter.agent_id, &ctx.agent_id)
            && field_matches(&filter.message_id, &ctx.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> OperationRegistry {
        OperationRegistry::new()
    }

    fn start(reg: &OperationRegistry) -> OperationHandle {
        reg.start_operation(StartOperation::new(OperationType::ExecAgentRuntime))
    }

    #[test]
    fn start_registers_running_operation() {
        let reg = registry();
        let handle = start(&reg);

        let op = reg.get(&handle.operation_id).unwrap();
        assert_eq!(op.status, OperationStatus::Running);
        assert!(!handle.cancellation.is_cancelled());
    }

    #[test]
    fn finalization_is_first_transition_wins() {
        let reg = registry();
        let handle = start(&reg);
        let id = &handle.operation_id;

        reg.complete_operation(id);
        assert_eq!(reg.get(id).unwrap().status, OperationStatus::Completed);

        // Subsequent finalizations are silently ignored.
        reg.cancel_operation(id, "too late");
        reg.fail_operation(
            id,
            OperationFailure::new(
                colloquy_types::error::FailureKind::Unknown,
                "too late",
            ),
        );
        reg.complete_operation(id);
        assert_eq!(reg.get(id).unwrap().status, OperationStatus::Completed);
    }

    #[test]
    fn fail_does_not_overwrite_cancellation() {
        let reg = registry();
        let handle = start(&reg);
        let id = &handle.operation_id;

        reg.cancel_operation(id, "user cancelled");
        reg.fail_operation(
            id,
            OperationFailure::new(
                colloquy_types::error::FailureKind::AgentExecution,
                "stream broke after cancel",
            ),
        );

        let op = reg.get(id).unwrap();
        assert_eq!(op.status, OperationStatus::Cancelled);
        assert!(op.metadata.error.is_none());
        assert_eq!(op.metadata.cancel_reason.as_deref(), Some("user cancelled"));
    }

    #[test]
    fn cancel_triggers_token_and_is_idempotent() {
        let reg = registry();
        let handle = start(&reg);

        reg.cancel_operation(&handle.operation_id, "stop");
        assert!(handle.cancellation.is_cancelled());

        // Second cancel is a no-op, not a panic.
        reg.cancel_operation(&handle.operation_id, "stop again");
        let op = reg.get(&handle.operation_id).unwrap();
        assert_eq!(op.metadata.cancel_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn cancel_handlers_run_exactly_once() {
        let reg = registry();
        let handle = start(&reg);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        reg.on_operation_cancel(&handle.operation_id, move |ctx| {
            assert_eq!(ctx.reason, "stop");
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        reg.cancel_operation(&handle.operation_id, "stop");
        reg.cancel_operation(&handle.operation_id, "stop");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_registered_after_cancel_runs_immediately() {
        let reg = registry();
        let handle = start(&reg);
        reg.cancel_operation(&handle.operation_id, "gone");

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        reg.on_operation_cancel(&handle.operation_id, move |ctx| {
            assert_eq!(ctx.reason, "gone");
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_inherits_context_and_parent_cancel_cascades() {
        let reg = registry();
        let parent = reg.start_operation(
            StartOperation::new(OperationType::ExecAgentRuntime).context(OperationContext {
                session_id: Some("sess-1".to_string()),
                topic_id: Some("topic-1".to_string()),
                ..Default::default()
            }),
        );
        let child = reg.start_operation(
            StartOperation::new(OperationType::GroupAgentStream)
                .parent(parent.operation_id.clone()),
        );

        let child_op = reg.get(&child.operation_id).unwrap();
        assert_eq!(child_op.context.session_id.as_deref(), Some("sess-1"));
        assert_eq!(
            reg.get(&parent.operation_id).unwrap().child_operation_ids,
            vec![child.operation_id.clone()]
        );

        reg.cancel_operation(&parent.operation_id, "user cancelled");

        assert!(child.cancellation.is_cancelled());
        assert_eq!(
            reg.get(&child.operation_id).unwrap().status,
            OperationStatus::Cancelled
        );
    }

    #[test]
    fn cancelling_message_cancels_all_associated_operations() {
        let reg = registry();
        let exec = reg.start_operation(
            StartOperation::new(OperationType::ExecAgentRuntime).context(OperationContext {
                message_id: Some("msg-1".to_string()),
                ..Default::default()
            }),
        );
        let stream = start(&reg);
        reg.associate_message("msg-1", &stream.operation_id);

        assert_eq!(reg.operations_for_message("msg-1").len(), 2);

        reg.cancel_operations_for_message("msg-1", "message deleted");

        assert_eq!(
            reg.get(&exec.operation_id).unwrap().status,
            OperationStatus::Cancelled
        );
        assert_eq!(
            reg.get(&stream.operation_id).unwrap().status,
            OperationStatus::Cancelled
        );
    }

    #[test]
    fn filter_cancellation_matches_session_and_type() {
        let reg = registry();
        let in_session = reg.start_operation(
            StartOperation::new(OperationType::ExecAgentRuntime).context(OperationContext {
                session_id: Some("sess-1".to_string()),
                ..Default::default()
            }),
        );
        let other_session = reg.start_operation(
            StartOperation::new(OperationType::ExecAgentRuntime).context(OperationContext {
                session_id: Some("sess-2".to_string()),
                ..Default::default()
            }),
        );

        let matched = reg.cancel_operations(
            &OperationFilter {
                session_id: Some("sess-1".to_string()),
                ..Default::default()
            },
            "session closed",
        );

        assert_eq!(matched, vec![in_session.operation_id.clone()]);
        assert_eq!(
            reg.get(&other_session.operation_id).unwrap().status,
            OperationStatus::Running
        );
    }

    #[test]
    fn metadata_updates_merge() {
        let reg = registry();
        let handle = start(&reg);

        reg.update_metadata(
            &handle.operation_id,
            MetadataPatch {
                step_count: Some(2),
                ..Default::default()
            },
        );
        reg.update_metadata(
            &handle.operation_id,
            MetadataPatch {
                needs_human_input: Some(true),
                ..Default::default()
            },
        );

        let op = reg.get(&handle.operation_id).unwrap();
        assert_eq!(op.metadata.step_count, Some(2));
        assert_eq!(op.metadata.needs_human_input, Some(true));
    }

    #[test]
    fn cleanup_removes_old_finished_and_keeps_indices() {
        let reg = registry();
        let done = reg.start_operation(
            StartOperation::new(OperationType::ExecAgentRuntime).context(OperationContext {
                message_id: Some("msg-1".to_string()),
                ..Default::default()
            }),
        );
        let live = start(&reg);
        reg.complete_operation(&done.operation_id);

        // max_age of zero sweeps anything finalized in the past.
        let removed = reg.cleanup_finished(Duration::milliseconds(-1));

        assert_eq!(removed, 1);
        assert!(reg.get(&done.operation_id).is_none());
        assert!(reg.get(&live.operation_id).is_some());
        assert!(reg.operations_for_message("msg-1").is_empty());
    }

    #[tokio::test]
    async fn concurrent_finalization_never_panics() {
        let reg = Arc::new(registry());
        let handle = start(&reg);
        let id = handle.operation_id.clone();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let reg = reg.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                match i % 3 {
                    0 => reg.complete_operation(&id),
                    1 => reg.cancel_operation(&id, "race"),
                    _ => reg.fail_operation(
                        &id,
                        OperationFailure::new(
                            colloquy_types::error::FailureKind::Unknown,
                            "race",
                        ),
                    ),
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Exactly one terminal status won and it stays put.
        let status = reg.get(&id).unwrap().status;
        assert!(status.is_terminal());
    }
}
