//! Rollback of completed steps after a failed run.
//!
//! Walks the compensation stack newest-first (`full`) or undoes only the most
//! recent entry (`partial`). A failing undo is logged and recorded, and the
//! walk continues with the next entry.

use std::sync::Arc;
use std::time::Instant;

use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::{
    CompensationEntry, CompensationPolicy, CompensationRecord, RunState, StepResult, StepStatus,
};

use super::context::ExecutionContext;
use super::resolver::{map_outputs, resolve_inputs};
use super::retry::RetryHandler;
use super::step_runner::RunShared;
use super::timeout::{effective_timeout, guard};

/// Tally of one rollback walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompensationSummary {
    pub compensated: usize,
    pub failed: usize,
}

pub(crate) struct CompensationController {
    shared: Arc<RunShared>,
}

impl CompensationController {
    pub fn new(shared: Arc<RunShared>) -> Self {
        Self { shared }
    }

    /// Entries to undo under `policy`, in execution order.
    pub fn plan(policy: CompensationPolicy, stack: &[CompensationEntry]) -> Vec<CompensationEntry> {
        match policy {
            CompensationPolicy::None => Vec::new(),
            CompensationPolicy::Partial => stack.last().cloned().into_iter().collect(),
            CompensationPolicy::Full => stack.iter().rev().cloned().collect(),
        }
    }

    /// Roll back `ctx` according to the workflow's policy. Does nothing for
    /// `none`.
    pub async fn run(&self, ctx: &mut ExecutionContext) -> CompensationSummary {
        let shared = &self.shared;
        let policy = shared.def.compensation_policy;
        if policy == CompensationPolicy::None {
            return CompensationSummary::default();
        }

        ctx.transition(RunState::Compensating);
        let entries = Self::plan(policy, &ctx.compensation_stack);
        tracing::info!(
            run_id = %shared.run_id,
            %policy,
            entries = entries.len(),
            "compensation started"
        );
        shared.emit(WorkflowEvent::CompensationStarted {
            run_id: shared.run_id,
            workflow_id: shared.workflow_id(),
            policy,
            entries: entries.len(),
        });

        let mut summary = CompensationSummary::default();
        for entry in entries {
            let (record, result) = self.undo(&entry, ctx).await;
            match record.status {
                StepStatus::Completed => summary.compensated += 1,
                StepStatus::Failed => summary.failed += 1,
            }
            ctx.record_result(result);
            ctx.compensation_log.push(record);
        }

        ctx.transition(RunState::Compensated);
        tracing::info!(
            run_id = %shared.run_id,
            compensated = summary.compensated,
            failed = summary.failed,
            "compensation finished"
        );
        shared.emit(WorkflowEvent::CompensationCompleted {
            run_id: shared.run_id,
            workflow_id: shared.workflow_id(),
            compensated: summary.compensated,
            failed: summary.failed,
        });
        summary
    }

    /// Invoke one compensation unit. Returns the log record and the unit's
    /// own step result.
    async fn undo(
        &self,
        entry: &CompensationEntry,
        ctx: &ExecutionContext,
    ) -> (CompensationRecord, StepResult) {
        let shared = &self.shared;
        let started = Instant::now();

        let (result, attempts) = match shared.compensations.get(&entry.compensation_step_id) {
            None => (
                Err(format!(
                    "compensation step '{}' not found",
                    entry.compensation_step_id
                )),
                0,
            ),
            Some(unit) => {
                let inputs = resolve_inputs(&unit.task.inputs, ctx);
                let policy = unit.retry.clone().unwrap_or_default();
                let timeout_ms = effective_timeout(
                    unit.timeout_ms,
                    shared.def.timeout_ms,
                    shared.config.default_step_timeout_ms,
                );
                let action = unit.task.action.as_str();
                let adapter = shared.adapter.as_ref();
                let outcome = RetryHandler::run(
                    &policy,
                    |_| {
                        let inputs = inputs.clone();
                        async move { guard(timeout_ms, adapter.invoke(action, inputs, ctx)).await }
                    },
                    |notice| {
                        let delay_ms = notice.delay.as_millis() as u64;
                        tracing::warn!(
                            step_id = %entry.step_id,
                            compensation_step_id = %entry.compensation_step_id,
                            attempt = notice.next_attempt,
                            delay_ms,
                            error = %notice.error,
                            "compensation failed, retrying"
                        );
                        shared.emit(WorkflowEvent::StepRetry {
                            run_id: shared.run_id,
                            workflow_id: shared.workflow_id(),
                            step_id: entry.compensation_step_id.clone(),
                            attempt: notice.next_attempt,
                            delay_ms,
                            error: notice.error.to_string(),
                        });
                    },
                )
                .await;
                let result = outcome
                    .result
                    .map(|raw| match &unit.task.outputs {
                        Some(mapping) => map_outputs(&raw, mapping),
                        None => raw,
                    })
                    .map_err(|e| e.to_string());
                (result, outcome.attempts)
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                tracing::info!(
                    run_id = %shared.run_id,
                    step_id = %entry.step_id,
                    compensation_step_id = %entry.compensation_step_id,
                    duration_ms,
                    "step compensated"
                );
                shared.emit(WorkflowEvent::CompensationStep {
                    run_id: shared.run_id,
                    workflow_id: shared.workflow_id(),
                    step_id: entry.step_id.clone(),
                    compensation_step_id: entry.compensation_step_id.clone(),
                    duration_ms,
                });
                let record = CompensationRecord {
                    step_id: entry.step_id.clone(),
                    compensation_step_id: entry.compensation_step_id.clone(),
                    status: StepStatus::Completed,
                    error: None,
                };
                let result = StepResult::completed(
                    &entry.compensation_step_id,
                    output,
                    duration_ms,
                    attempts,
                );
                (record, result)
            }
            Err(error) => {
                tracing::error!(
                    run_id = %shared.run_id,
                    step_id = %entry.step_id,
                    compensation_step_id = %entry.compensation_step_id,
                    %error,
                    "compensation failed"
                );
                shared.emit(WorkflowEvent::CompensationFailed {
                    run_id: shared.run_id,
                    workflow_id: shared.workflow_id(),
                    step_id: entry.step_id.clone(),
                    compensation_step_id: entry.compensation_step_id.clone(),
                    error: error.clone(),
                });
                let result = StepResult::failed(
                    &entry.compensation_step_id,
                    error.clone(),
                    duration_ms,
                    attempts,
                );
                let record = CompensationRecord {
                    step_id: entry.step_id.clone(),
                    compensation_step_id: entry.compensation_step_id.clone(),
                    status: StepStatus::Failed,
                    error: Some(error),
                };
                (record, result)
            }
        }
    }
}
