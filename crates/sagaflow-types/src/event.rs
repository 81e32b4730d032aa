//! Event types for the sagaflow run event stream.
//!
//! `WorkflowEvent` is the unified event type broadcast while a run executes.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.
//! On the wire each event is tagged with its topic name (`step:retry`, ...).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::CompensationPolicy;

/// Lifecycle events emitted during a workflow run.
///
/// Every variant carries the run and workflow ids; step-scoped variants also
/// carry the step id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkflowEvent {
    /// The run has started executing its top-level sequence.
    #[serde(rename = "workflow:start")]
    WorkflowStarted {
        run_id: Uuid,
        workflow_id: String,
        workflow_name: String,
        version: String,
    },

    /// The run finished with every executed step settled.
    #[serde(rename = "workflow:complete")]
    WorkflowCompleted {
        run_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        steps_completed: usize,
    },

    /// The run failed. Emitted after any compensation has finished.
    #[serde(rename = "workflow:failed")]
    WorkflowFailed {
        run_id: Uuid,
        workflow_id: String,
        error: String,
        duration_ms: u64,
    },

    #[serde(rename = "step:start")]
    StepStarted {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        step_type: String,
    },

    #[serde(rename = "step:complete")]
    StepCompleted {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        duration_ms: u64,
        attempts: u32,
    },

    #[serde(rename = "step:failed")]
    StepFailed {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        error: String,
        duration_ms: u64,
        attempts: u32,
    },

    /// The step was passed over by its dependency or condition gate.
    #[serde(rename = "step:skipped")]
    StepSkipped {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        reason: String,
    },

    /// A failed attempt will be retried after `delay_ms`.
    #[serde(rename = "step:retry")]
    StepRetry {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        /// The attempt about to be made (2 for the first retry).
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    #[serde(rename = "parallel:start")]
    ParallelStarted {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        branches: usize,
        concurrency: usize,
    },

    #[serde(rename = "parallel:complete")]
    ParallelCompleted {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        duration_ms: u64,
        peak_concurrency: usize,
    },

    #[serde(rename = "parallel:failed")]
    ParallelFailed {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        error: String,
        failed_branches: usize,
        peak_concurrency: usize,
    },

    #[serde(rename = "conditional:matched")]
    ConditionalMatched {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        case_index: usize,
    },

    #[serde(rename = "conditional:default")]
    ConditionalDefault {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
    },

    #[serde(rename = "conditional:no-match")]
    ConditionalNoMatch {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
    },

    /// Rollback is starting with `entries` compensations to walk.
    #[serde(rename = "compensation:start")]
    CompensationStarted {
        run_id: Uuid,
        workflow_id: String,
        policy: CompensationPolicy,
        entries: usize,
    },

    /// One compensation action succeeded.
    #[serde(rename = "compensation:step")]
    CompensationStep {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        compensation_step_id: String,
        duration_ms: u64,
    },

    #[serde(rename = "compensation:complete")]
    CompensationCompleted {
        run_id: Uuid,
        workflow_id: String,
        compensated: usize,
        failed: usize,
    },

    /// One compensation action failed; the walk continues.
    #[serde(rename = "compensation:failed")]
    CompensationFailed {
        run_id: Uuid,
        workflow_id: String,
        step_id: String,
        compensation_step_id: String,
        error: String,
    },
}

impl WorkflowEvent {
    /// The topic name of the event, e.g. `"conditional:no-match"`.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "workflow:start",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow:complete",
            WorkflowEvent::WorkflowFailed { .. } => "workflow:failed",
            WorkflowEvent::StepStarted { .. } => "step:start",
            WorkflowEvent::StepCompleted { .. } => "step:complete",
            WorkflowEvent::StepFailed { .. } => "step:failed",
            WorkflowEvent::StepSkipped { .. } => "step:skipped",
            WorkflowEvent::StepRetry { .. } => "step:retry",
            WorkflowEvent::ParallelStarted { .. } => "parallel:start",
            WorkflowEvent::ParallelCompleted { .. } => "parallel:complete",
            WorkflowEvent::ParallelFailed { .. } => "parallel:failed",
            WorkflowEvent::ConditionalMatched { .. } => "conditional:matched",
            WorkflowEvent::ConditionalDefault { .. } => "conditional:default",
            WorkflowEvent::ConditionalNoMatch { .. } => "conditional:no-match",
            WorkflowEvent::CompensationStarted { .. } => "compensation:start",
            WorkflowEvent::CompensationStep { .. } => "compensation:step",
            WorkflowEvent::CompensationCompleted { .. } => "compensation:complete",
            WorkflowEvent::CompensationFailed { .. } => "compensation:failed",
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::WorkflowStarted { run_id, .. }
            | WorkflowEvent::WorkflowCompleted { run_id, .. }
            | WorkflowEvent::WorkflowFailed { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::StepRetry { run_id, .. }
            | WorkflowEvent::ParallelStarted { run_id, .. }
            | WorkflowEvent::ParallelCompleted { run_id, .. }
            | WorkflowEvent::ParallelFailed { run_id, .. }
            | WorkflowEvent::ConditionalMatched { run_id, .. }
            | WorkflowEvent::ConditionalDefault { run_id, .. }
            | WorkflowEvent::ConditionalNoMatch { run_id, .. }
            | WorkflowEvent::CompensationStarted { run_id, .. }
            | WorkflowEvent::CompensationStep { run_id, .. }
            | WorkflowEvent::CompensationCompleted { run_id, .. }
            | WorkflowEvent::CompensationFailed { run_id, .. } => *run_id,
        }
    }

    /// Returns the step id from step-scoped variants, or None for run-scoped
    /// lifecycle events.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepStarted { step_id, .. }
            | WorkflowEvent::StepCompleted { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. }
            | WorkflowEvent::StepSkipped { step_id, .. }
            | WorkflowEvent::StepRetry { step_id, .. }
            | WorkflowEvent::ParallelStarted { step_id, .. }
            | WorkflowEvent::ParallelCompleted { step_id, .. }
            | WorkflowEvent::ParallelFailed { step_id, .. }
            | WorkflowEvent::ConditionalMatched { step_id, .. }
            | WorkflowEvent::ConditionalDefault { step_id, .. }
            | WorkflowEvent::ConditionalNoMatch { step_id, .. }
            | WorkflowEvent::CompensationStep { step_id, .. }
            | WorkflowEvent::CompensationFailed { step_id, .. } => Some(step_id),

            WorkflowEvent::WorkflowStarted { .. }
            | WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowFailed { .. }
            | WorkflowEvent::CompensationStarted { .. }
            | WorkflowEvent::CompensationCompleted { .. } => None,
        }
    }
}
