//! Deadline guard for task invocations.
//!
//! The effective timeout of a step is its own `timeoutMs`, else the
//! workflow's, else the engine default, else none. An expired invocation is
//! abandoned and reported as a `TIMEOUT` task error, which the retry
//! controller treats like any other failure.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use super::adapter::TaskError;

/// First configured timeout, most specific wins.
pub fn effective_timeout(
    step_ms: Option<u64>,
    workflow_ms: Option<u64>,
    engine_default_ms: Option<u64>,
) -> Option<u64> {
    step_ms.or(workflow_ms).or(engine_default_ms)
}

/// Race `fut` against `timeout_ms`. With no timeout, `fut` runs to completion.
pub async fn guard<F>(timeout_ms: Option<u64>, fut: F) -> Result<Value, TaskError>
where
    F: Future<Output = Result<Value, TaskError>>,
{
    match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
            .await
            .unwrap_or_else(|_| Err(TaskError::timeout(ms))),
        None => fut.await,
    }
}
