//! Run-time step failures.
//!
//! `StepError` is what a failed unit surfaces to its enclosing sequence and,
//! when unrecovered, what the run reports as its triggering error. Task-level
//! failures from the adapter are wrapped, never rewritten.

use serde::Serialize;
use thiserror::Error;

use super::adapter::{TaskError, TaskErrorKind};

/// One failed branch of a parallel unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchFailure {
    pub index: usize,
    pub error: StepError,
}

/// A unit-level failure.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// The task adapter failed and retries were exhausted.
    #[error("step '{step_id}' failed: {error}")]
    TaskExecution { step_id: String, error: TaskError },

    /// The last attempt exceeded the step deadline.
    #[error("step '{step_id}' timed out after {timeout_ms}ms")]
    Timeout { step_id: String, timeout_ms: u64 },

    /// One or more branches of a parallel unit failed.
    #[error("parallel step '{step_id}' failed in {} branch(es): {}", .failures.len(), summarize(.failures))]
    ParallelBranchFailure {
        step_id: String,
        failures: Vec<BranchFailure>,
    },

    /// A branch task panicked or was aborted by the runtime.
    #[error("parallel step '{step_id}' had an aborted branch: {message}")]
    BranchAborted { step_id: String, message: String },

    /// The run was cancelled before this unit was admitted.
    #[error("run cancelled before step '{step_id}'")]
    Cancelled { step_id: String },
}

fn summarize(failures: &[BranchFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.index, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl StepError {
    /// Wrap the final task error of a step, promoting deadlines to `Timeout`.
    pub fn from_task(step_id: &str, error: TaskError, timeout_ms: Option<u64>) -> Self {
        match (error.kind, timeout_ms) {
            (TaskErrorKind::Timeout, Some(timeout_ms)) => StepError::Timeout {
                step_id: step_id.to_string(),
                timeout_ms,
            },
            _ => StepError::TaskExecution {
                step_id: step_id.to_string(),
                error,
            },
        }
    }

    /// The id of the unit that failed.
    pub fn step_id(&self) -> &str {
        match self {
            StepError::TaskExecution { step_id, .. }
            | StepError::Timeout { step_id, .. }
            | StepError::ParallelBranchFailure { step_id, .. }
            | StepError::BranchAborted { step_id, .. }
            | StepError::Cancelled { step_id } => step_id,
        }
    }

    /// Short machine-readable classification.
    pub fn code(&self) -> &'static str {
        match self {
            StepError::TaskExecution { .. } => "TASK_EXECUTION_ERROR",
            StepError::Timeout { .. } => "TIMEOUT",
            StepError::ParallelBranchFailure { .. } => "PARALLEL_BRANCH_FAILURE",
            StepError::BranchAborted { .. } => "BRANCH_ABORTED",
            StepError::Cancelled { .. } => "CANCELLED",
        }
    }
}
