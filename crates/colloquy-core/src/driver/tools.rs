//! Tool execution boundary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use colloquy_types::error::DriverError;
use colloquy_types::message::ToolCallPayload;

/// Outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub content: String,
    pub is_success: bool,
    pub execution_time_ms: u64,
}

/// Tool execution boundary. Uses native async fn in traits (RPITIT, Rust
/// 2024 edition).
pub trait ToolExecutor: Send + Sync {
    /// Whether this call must be approved by a human before running.
    fn requires_approval(&self, call: &ToolCallPayload) -> bool;

    /// Run the tool. Failures that are the tool's own (bad arguments, remote
    /// error) come back as a non-success result; `Err` is reserved for calls
    /// that cannot run at all (unknown tool).
    fn execute(
        &self,
        call: &ToolCallPayload,
    ) -> impl std::future::Future<Output = Result<ToolExecutionResult, DriverError>> + Send;
}

type ToolFn = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// Registry of synchronous tool handlers keyed by `identifier/apiName`.
///
/// Enough for builtin tools and tests; remote/plugin execution implements
/// `ToolExecutor` directly.
#[derive(Clone, Default)]
pub struct FnToolExecutor {
    handlers: HashMap<String, ToolFn>,
    approval_required: HashSet<String>,
}

impl FnToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(call: &ToolCallPayload) -> String {
        format!("{}/{}", call.identifier, call.api_name)
    }

    /// Register a handler for `identifier/api_name`.
    pub fn register<F>(mut self, identifier: &str, api_name: &str, handler: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.handlers
            .insert(format!("{identifier}/{api_name}"), Arc::new(handler));
        self
    }

    /// Mark a tool as requiring human approval before execution.
    pub fn require_approval(mut self, identifier: &str, api_name: &str) -> Self {
        self.approval_required
            .insert(format!("{identifier}/{api_name}"));
        self
    }
}

impl ToolExecutor for FnToolExecutor {
    fn requires_approval(&self, call: &ToolCallPayload) -> bool {
        self.approval_required.contains(&Self::key(call))
    }

    async fn execute(&self, call: &ToolCallPayload) -> Result<ToolExecutionResult, DriverError> {
        let key = Self::key(call);
        let handler = self
            .handlers
            .get(&key)
            .ok_or_else(|| DriverError::ToolNotFound(key.clone()))?;

        let start = Instant::now();
        let result = handler(&call.arguments);
        let execution_time_ms = start.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(content) => ToolExecutionResult {
                content,
                is_success: true,
                execution_time_ms,
            },
            Err(message) => ToolExecutionResult {
                content: message,
                is_success: false,
                execution_time_ms,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(identifier: &str, api_name: &str, args: &str) -> ToolCallPayload {
        ToolCallPayload {
            id: "call-1".to_string(),
            identifier: identifier.to_string(),
            api_name: api_name.to_string(),
            arguments: args.to_string(),
        }
    }

    #[tokio::test]
    async fn registered_tool_executes() {
        let tools = FnToolExecutor::new().register("math", "double", |args| {
            let n: i64 = args.parse().map_err(|_| "not a number".to_string())?;
            Ok((n * 2).to_string())
        });

        let result = tools.execute(&call("math", "double", "21")).await.unwrap();
        assert!(result.is_success);
        assert_eq!(result.content, "42");
    }

    #[tokio::test]
    async fn tool_failure_is_a_non_success_result() {
        let tools = FnToolExecutor::new().register("math", "double", |args| {
            let n: i64 = args.parse().map_err(|_| "not a number".to_string())?;
            Ok((n * 2).to_string())
        });

        let result = tools.execute(&call("math", "double", "nope")).await.unwrap();
        assert!(!result.is_success);
        assert_eq!(result.content, "not a number");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let tools = FnToolExecutor::new();
        let result = tools.execute(&call("web", "search", "{}")).await;
        assert!(matches!(result, Err(DriverError::ToolNotFound(_))));
    }

    #[test]
    fn approval_flag_per_tool() {
        let tools = FnToolExecutor::new()
            .register("shell", "run", |_| Ok(String::new()))
            .require_approval("shell", "run");

        assert!(tools.requires_approval(&call("shell", "run", "{}")));
        assert!(!tools.requires_approval(&call("math", "double", "1")));
    }
}
