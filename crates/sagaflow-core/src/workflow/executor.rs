//! Workflow engine: drives one run from `pending` to a terminal state.
//!
//! # Execution flow
//!
//! 1. Reject cyclic `dependsOn` graphs before anything runs.
//! 2. Create the run's `ExecutionContext` and move it to `running`.
//! 3. Walk the top-level sequence through the `StepRunner`.
//! 4. On success the run is `completed`. On failure the triggering error is
//!    stored, the run is `failed`, and the compensation controller rolls back
//!    per the workflow's policy (ending in `compensated`).
//!
//! Every run gets its own `EventBus` unless the caller injects one through
//! `RunOptions`, so concurrent runs never share a sink by accident.

use std::sync::Arc;

use sagaflow_types::config::EngineConfig;
use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::{RunState, WorkflowDefinition};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::event::EventBus;

use super::adapter::{BoxTaskAdapter, TaskAdapter};
use super::compensation::CompensationController;
use super::context::ExecutionContext;
use super::dag::check_acyclic;
use super::definition::WorkflowError;
use super::step_runner::{RunShared, Scope, StepRunner};

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// Per-run wiring supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Sink for lifecycle events. A private bus is created when absent.
    pub events: Option<EventBus>,
    /// Cancels the run before the next unit is admitted.
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes workflow definitions against a task adapter.
///
/// Cheap to clone; clones share the adapter.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    adapter: Arc<BoxTaskAdapter>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new<A: TaskAdapter + 'static>(adapter: A, config: EngineConfig) -> Self {
        Self::from_boxed(BoxTaskAdapter::new(adapter), config)
    }

    pub fn from_boxed(adapter: BoxTaskAdapter, config: EngineConfig) -> Self {
        Self {
            adapter: Arc::new(adapter),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `def` with caller `inputs` and default options.
    pub async fn execute(
        &self,
        def: &WorkflowDefinition,
        inputs: Value,
    ) -> Result<ExecutionContext, WorkflowError> {
        self.execute_with(def, inputs, RunOptions::default()).await
    }

    /// Run `def` to a terminal state.
    ///
    /// `Err` is returned only when the run is rejected before it starts.
    /// Step failures are reported through the returned context (`state`,
    /// `error`, `step_results`).
    pub async fn execute_with(
        &self,
        def: &WorkflowDefinition,
        inputs: Value,
        options: RunOptions,
    ) -> Result<ExecutionContext, WorkflowError> {
        check_acyclic(&def.steps)?;

        let def = Arc::new(def.clone());
        let events = options
            .events
            .unwrap_or_else(|| EventBus::new(self.config.event_capacity));
        let mut ctx = ExecutionContext::new(&def.id, inputs, self.config.max_step_output_bytes);
        let shared = Arc::new(RunShared::new(
            Arc::clone(&self.adapter),
            self.config.clone(),
            Arc::clone(&def),
            events,
            options.cancel,
            ctx.run_id,
        ));

        ctx.transition(RunState::Running);
        tracing::info!(
            run_id = %ctx.run_id,
            workflow_id = %def.id,
            version = %def.version,
            steps = def.steps.len(),
            "workflow started"
        );
        shared.emit(WorkflowEvent::WorkflowStarted {
            run_id: ctx.run_id,
            workflow_id: def.id.clone(),
            workflow_name: def.name.clone(),
            version: def.version.clone(),
        });

        let runner = StepRunner::new(Arc::clone(&shared));
        let mut scope = Scope::root(ctx, shared.cancel.clone());
        let outcome = runner.run_sequence(&mut scope, &def.steps).await;
        let mut ctx = scope.into_context();

        match outcome {
            Ok(()) => {
                ctx.transition(RunState::Completed);
                let steps_completed = ctx.completed_count();
                tracing::info!(
                    run_id = %ctx.run_id,
                    duration_ms = ctx.duration_ms(),
                    steps_completed,
                    "workflow completed"
                );
                shared.emit(WorkflowEvent::WorkflowCompleted {
                    run_id: ctx.run_id,
                    workflow_id: def.id.clone(),
                    duration_ms: ctx.duration_ms(),
                    steps_completed,
                });
            }
            Err(error) => {
                tracing::error!(
                    run_id = %ctx.run_id,
                    step_id = error.step_id(),
                    code = error.code(),
                    %error,
                    "workflow failed"
                );
                ctx.error = Some(error.clone());
                ctx.transition(RunState::Failed);

                CompensationController::new(Arc::clone(&shared))
                    .run(&mut ctx)
                    .await;

                shared.emit(WorkflowEvent::WorkflowFailed {
                    run_id: ctx.run_id,
                    workflow_id: def.id.clone(),
                    error: error.to_string(),
                    duration_ms: ctx.duration_ms(),
                });
            }
        }

        Ok(ctx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
