//! Task adapter seam: how step `action`s reach the outside world.
//!
//! The engine is agnostic to what a task does. A `TaskAdapter` receives the
//! action identifier, the resolved inputs and a read-only view of the run's
//! context, and produces a JSON result or a `TaskError`.
//!
//! Follows the RPITIT + blanket-impl pattern used for other async seams:
//! 1. `TaskAdapter` uses native `impl Future` returns
//! 2. Object-safe `TaskAdapterDyn` with boxed futures, blanket-implemented
//! 3. `BoxTaskAdapter` wraps `Box<dyn TaskAdapterDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};

use super::context::ExecutionContext;

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Coarse classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The adapter reported a failure.
    Failed,
    /// The invocation did not finish before its deadline.
    Timeout,
}

/// Error returned by a task adapter invocation.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    /// Machine-readable code matched against `retryableErrors`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Code carried by deadline failures.
pub const TIMEOUT_CODE: &str = "TIMEOUT";

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Failed,
            code: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Failed,
            code: Some(code.into()),
            message: message.into(),
            details: None,
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: TaskErrorKind::Timeout,
            code: Some(TIMEOUT_CODE.to_string()),
            message: format!("timed out after {timeout_ms}ms"),
            details: None,
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// TaskAdapter
// ---------------------------------------------------------------------------

/// Executes the business action bound to a task or compensation step.
///
/// Implementations must not mutate the context; it is a snapshot of what the
/// run has recorded so far.
pub trait TaskAdapter: Send + Sync {
    fn invoke(
        &self,
        action: &str,
        inputs: Value,
        ctx: &ExecutionContext,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send;
}

/// Object-safe version of [`TaskAdapter`] with boxed futures.
pub trait TaskAdapterDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        inputs: Value,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'a>>;
}

impl<T: TaskAdapter> TaskAdapterDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        inputs: Value,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'a>> {
        Box::pin(self.invoke(action, inputs, ctx))
    }
}

/// Type-erased task adapter, so the engine can be built around any adapter
/// chosen at runtime.
pub struct BoxTaskAdapter {
    inner: Box<dyn TaskAdapterDyn>,
}

impl BoxTaskAdapter {
    pub fn new<T: TaskAdapter + 'static>(adapter: T) -> Self {
        Self {
            inner: Box::new(adapter),
        }
    }

    pub async fn invoke(
        &self,
        action: &str,
        inputs: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, TaskError> {
        self.inner.invoke_boxed(action, inputs, ctx).await
    }
}

impl std::fmt::Debug for BoxTaskAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTaskAdapter").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// DryRunAdapter
// ---------------------------------------------------------------------------

/// Simulates every action: echoes `{action, inputs, simulated: true}` after an
/// optional latency. Never fails.
#[derive(Debug, Clone, Default)]
pub struct DryRunAdapter {
    latency: Duration,
}

impl DryRunAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl TaskAdapter for DryRunAdapter {
    async fn invoke(
        &self,
        action: &str,
        inputs: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, TaskError> {
        tracing::debug!(action, run_id = %ctx.run_id, "dry-run invocation");
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(json!({
            "action": action,
            "inputs": inputs,
            "simulated": true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("wf", json!({}), 1024)
    }

    #[tokio::test]
    async fn test_dry_run_echoes_action_and_inputs() {
        let adapter = DryRunAdapter::new();
        let result = adapter
            .invoke("payments.charge", json!({"amount": 5}), &ctx())
            .await
            .unwrap();
        assert_eq!(result["action"], "payments.charge");
        assert_eq!(result["inputs"]["amount"], 5);
        assert_eq!(result["simulated"], true);
    }

    #[tokio::test]
    async fn test_box_adapter_delegates() {
        let boxed = BoxTaskAdapter::new(DryRunAdapter::with_latency(Duration::from_millis(1)));
        let result = boxed.invoke("noop", Value::Null, &ctx()).await.unwrap();
        assert_eq!(result["action"], "noop");
        assert!(format!("{boxed:?}").contains("BoxTaskAdapter"));
    }

    #[test]
    fn test_task_error_constructors() {
        let err = TaskError::timeout(250);
        assert_eq!(err.kind, TaskErrorKind::Timeout);
        assert_eq!(err.code.as_deref(), Some(TIMEOUT_CODE));
        assert_eq!(err.to_string(), "timed out after 250ms");

        let err = TaskError::with_code("E_LIMIT", "rate limited").details(json!({"retryAfter": 3}));
        assert_eq!(err.kind, TaskErrorKind::Failed);
        assert_eq!(err.details.unwrap()["retryAfter"], 3);
    }
}
