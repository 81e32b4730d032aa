//! Step dispatch: gating, task invocation and composite units.
//!
//! `StepRunner` walks a sequence of step units in declaration order. Each unit
//! passes the dependency gate and the condition gate, then dispatches by kind:
//!
//! - **task** -- resolve inputs, invoke through retry + timeout + adapter,
//!   record the result and register its compensation
//! - **parallel** -- run branches on forked scopes under the concurrency
//!   governor, then merge their journals back in completion order
//! - **conditional** -- first matching case wins, else `default`
//! - **compensation** -- never run forward; only the rollback walk invokes it
//!
//! A failed unit aborts its sequence unless it declares `onFailure: continue`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures_util::future::BoxFuture;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::{
    CompensationEntry, CompensationStep, ConditionalStep, ParallelStep, SkipReason, SkippedStep,
    StepResult, StepUnit, TaskStep, WorkflowDefinition,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;

use super::adapter::BoxTaskAdapter;
use super::context::{ContextUpdate, ExecutionContext};
use super::error::{BranchFailure, StepError};
use super::expression::evaluate_condition;
use super::governor::ConcurrencyGovernor;
use super::resolver::{map_outputs, resolve_inputs};
use super::retry::RetryHandler;
use super::timeout::{effective_timeout, guard};

// ---------------------------------------------------------------------------
// Run-wide shared state
// ---------------------------------------------------------------------------

/// Immutable state shared by every task of one run.
pub(crate) struct RunShared {
    pub adapter: Arc<BoxTaskAdapter>,
    pub config: EngineConfig,
    pub def: Arc<WorkflowDefinition>,
    pub events: EventBus,
    pub cancel: CancellationToken,
    pub run_id: Uuid,
    /// Compensation units by id, wherever they are declared.
    pub compensations: HashMap<String, CompensationStep>,
    /// Registration order of compensation entries across all branches.
    sequence: AtomicU64,
}

impl RunShared {
    pub fn new(
        adapter: Arc<BoxTaskAdapter>,
        config: EngineConfig,
        def: Arc<WorkflowDefinition>,
        events: EventBus,
        cancel: CancellationToken,
        run_id: Uuid,
    ) -> Self {
        let compensations = super::dag::compensation_index(&def.steps);
        Self {
            adapter,
            config,
            def,
            events,
            cancel,
            run_id,
            compensations,
            sequence: AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub fn workflow_id(&self) -> String {
        self.def.id.clone()
    }

    pub fn emit(&self, event: WorkflowEvent) {
        self.events.publish(event);
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The context a sequence writes to.
///
/// The root scope owns the run's context. A branch scope works on a fork and
/// also journals every change so the owner can replay it after the branch
/// finishes. `abort` is the admission token of the innermost enclosing
/// parallel unit, so fail-fast in an outer group also stops nested groups
/// from admitting more branches.
pub(crate) struct Scope {
    pub ctx: ExecutionContext,
    journal: Option<Vec<ContextUpdate>>,
    abort: CancellationToken,
}

impl Scope {
    pub fn root(ctx: ExecutionContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            journal: None,
            abort: cancel,
        }
    }

    fn fork(&self, abort: CancellationToken) -> Self {
        Self {
            ctx: self.ctx.clone(),
            journal: Some(Vec::new()),
            abort,
        }
    }

    fn record(&mut self, update: ContextUpdate) {
        if let Some(journal) = &mut self.journal {
            journal.push(update.clone());
        }
        self.ctx.apply(update);
    }

    fn into_journal(self) -> Vec<ContextUpdate> {
        self.journal.unwrap_or_default()
    }

    pub fn into_context(self) -> ExecutionContext {
        self.ctx
    }
}

/// What a finished parallel branch hands back to its owner.
struct BranchOutcome {
    result: Result<(), StepError>,
    journal: Vec<ContextUpdate>,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct StepRunner {
    shared: Arc<RunShared>,
}

impl StepRunner {
    pub fn new(shared: Arc<RunShared>) -> Self {
        Self { shared }
    }

    /// Run `steps` in order. `Err` means the sequence was aborted by a failed
    /// unit (or by cancellation).
    pub fn run_sequence<'a>(
        &'a self,
        scope: &'a mut Scope,
        steps: &'a [StepUnit],
    ) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            for unit in steps {
                if let StepUnit::Compensation(comp) = unit {
                    tracing::trace!(step_id = %comp.id, "compensation unit not run forward");
                    continue;
                }

                let step_id = unit.id();
                if self.shared.cancel.is_cancelled() {
                    tracing::info!(run_id = %self.shared.run_id, step_id, "run cancelled");
                    return Err(StepError::Cancelled {
                        step_id: step_id.to_string(),
                    });
                }

                let missing: Vec<String> = unit
                    .depends_on()
                    .iter()
                    .filter(|dep| !scope.ctx.is_completed(dep))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    self.skip(scope, step_id, SkipReason::DependencyUnmet { missing });
                    continue;
                }

                if let Some(condition) = unit.condition() {
                    if !evaluate_condition(condition, &scope.ctx, step_id) {
                        self.skip(scope, step_id, SkipReason::ConditionFalse);
                        continue;
                    }
                }

                let outcome = match unit {
                    StepUnit::Task(task) => self.run_task(scope, task).await,
                    StepUnit::Parallel(parallel) => self.run_parallel(scope, parallel).await,
                    StepUnit::Conditional(conditional) => {
                        self.run_conditional(scope, conditional).await
                    }
                    StepUnit::Compensation(_) => Ok(()),
                };

                if let Err(error) = outcome {
                    if unit.on_failure().aborts_sequence() {
                        return Err(error);
                    }
                    tracing::warn!(
                        run_id = %self.shared.run_id,
                        step_id,
                        %error,
                        "step failed, continuing"
                    );
                }
            }
            Ok(())
        })
    }

    fn skip(&self, scope: &mut Scope, step_id: &str, reason: SkipReason) {
        tracing::info!(run_id = %self.shared.run_id, step_id, %reason, "step skipped");
        self.shared.emit(WorkflowEvent::StepSkipped {
            run_id: self.shared.run_id,
            workflow_id: self.shared.workflow_id(),
            step_id: step_id.to_string(),
            reason: reason.to_string(),
        });
        scope.record(ContextUpdate::Skipped(SkippedStep {
            step_id: step_id.to_string(),
            reason,
        }));
    }

    fn emit_started(&self, step_id: &str, step_type: &str) {
        self.shared.emit(WorkflowEvent::StepStarted {
            run_id: self.shared.run_id,
            workflow_id: self.shared.workflow_id(),
            step_id: step_id.to_string(),
            step_type: step_type.to_string(),
        });
    }

    /// Record the unit's result and emit its terminal step event.
    fn finish(&self, scope: &mut Scope, result: StepResult) {
        let event = match &result.error {
            None => WorkflowEvent::StepCompleted {
                run_id: self.shared.run_id,
                workflow_id: self.shared.workflow_id(),
                step_id: result.step_id.clone(),
                duration_ms: result.duration_ms,
                attempts: result.attempts,
            },
            Some(error) => WorkflowEvent::StepFailed {
                run_id: self.shared.run_id,
                workflow_id: self.shared.workflow_id(),
                step_id: result.step_id.clone(),
                error: error.clone(),
                duration_ms: result.duration_ms,
                attempts: result.attempts,
            },
        };
        scope.record(ContextUpdate::Result(result));
        self.shared.emit(event);
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    async fn run_task(&self, scope: &mut Scope, task: &TaskStep) -> Result<(), StepError> {
        let shared = &self.shared;
        let started = Instant::now();
        self.emit_started(&task.id, "task");

        let inputs = resolve_inputs(&task.task.inputs, &scope.ctx);
        let policy = task
            .retry
            .clone()
            .or_else(|| shared.def.retry_policy.clone())
            .unwrap_or_default();
        let timeout_ms = effective_timeout(
            task.timeout_ms,
            shared.def.timeout_ms,
            shared.config.default_step_timeout_ms,
        );

        let action = task.task.action.as_str();
        let adapter = shared.adapter.as_ref();
        let ctx = &scope.ctx;
        let outcome = RetryHandler::run(
            &policy,
            |attempt| {
                let inputs = inputs.clone();
                tracing::debug!(run_id = %shared.run_id, step_id = %task.id, action, attempt, "invoking task");
                async move { guard(timeout_ms, adapter.invoke(action, inputs, ctx)).await }
            },
            |notice| {
                tracing::warn!(
                    run_id = %shared.run_id,
                    step_id = %task.id,
                    attempt = notice.next_attempt,
                    delay_ms = notice.delay.as_millis() as u64,
                    error = %notice.error,
                    "task failed, retrying"
                );
                shared.emit(WorkflowEvent::StepRetry {
                    run_id: shared.run_id,
                    workflow_id: shared.workflow_id(),
                    step_id: task.id.clone(),
                    attempt: notice.next_attempt,
                    delay_ms: notice.delay.as_millis() as u64,
                    error: notice.error.to_string(),
                });
            },
        )
        .await;

        let duration_ms = elapsed_ms(started);
        match outcome.result {
            Ok(raw) => {
                let output = match &task.task.outputs {
                    Some(mapping) => map_outputs(&raw, mapping),
                    None => raw,
                };
                tracing::info!(
                    run_id = %shared.run_id,
                    step_id = %task.id,
                    duration_ms,
                    attempts = outcome.attempts,
                    "task completed"
                );
                self.finish(
                    scope,
                    StepResult::completed(&task.id, output, duration_ms, outcome.attempts),
                );
                if let Some(compensation_step_id) = &task.compensation {
                    let entry = CompensationEntry {
                        step_id: task.id.clone(),
                        compensation_step_id: compensation_step_id.clone(),
                        sequence: shared.next_sequence(),
                    };
                    tracing::debug!(
                        step_id = %task.id,
                        compensation_step_id = %compensation_step_id,
                        sequence = entry.sequence,
                        "compensation registered"
                    );
                    scope.record(ContextUpdate::Compensation(entry));
                }
                Ok(())
            }
            Err(task_error) => {
                let error = StepError::from_task(&task.id, task_error, timeout_ms);
                tracing::warn!(
                    run_id = %shared.run_id,
                    step_id = %task.id,
                    attempts = outcome.attempts,
                    %error,
                    "task failed"
                );
                self.finish(
                    scope,
                    StepResult::failed(&task.id, error.to_string(), duration_ms, outcome.attempts),
                );
                Err(error)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    async fn run_parallel(&self, scope: &mut Scope, parallel: &ParallelStep) -> Result<(), StepError> {
        let shared = &self.shared;
        let started = Instant::now();
        let limit = ConcurrencyGovernor::effective_limit(
            parallel.max_concurrency,
            parallel.branches.len(),
            shared.def.max_concurrency,
            shared.config.max_concurrency,
        );
        self.emit_started(&parallel.id, "parallel");
        shared.emit(WorkflowEvent::ParallelStarted {
            run_id: shared.run_id,
            workflow_id: shared.workflow_id(),
            step_id: parallel.id.clone(),
            branches: parallel.branches.len(),
            concurrency: limit,
        });
        tracing::info!(
            run_id = %shared.run_id,
            step_id = %parallel.id,
            branches = parallel.branches.len(),
            limit,
            "parallel step started"
        );

        // Only a unit that aborts its sequence stops admitting on failure.
        let fail_fast = parallel.on_failure.aborts_sequence();
        let abort = scope.abort.child_token();
        let jobs: Vec<_> = parallel
            .branches
            .iter()
            .map(|branch| {
                let runner = self.clone();
                let mut fork = scope.fork(abort.clone());
                let branch = branch.clone();
                move |index: usize| async move {
                    tracing::debug!(branch = index, "parallel branch admitted");
                    let result = runner.run_sequence(&mut fork, &branch).await;
                    BranchOutcome {
                        result,
                        journal: fork.into_journal(),
                    }
                }
            })
            .collect();

        let governor = ConcurrencyGovernor::new(limit);
        let report = governor
            .run(jobs, abort, |outcome: &BranchOutcome| {
                fail_fast && outcome.result.is_err()
            })
            .await;

        let mut statuses = vec![json!("not_admitted"); parallel.branches.len()];
        let mut failures = Vec::new();
        for (index, outcome) in report.outcomes {
            for update in outcome.journal {
                scope.record(update);
            }
            match outcome.result {
                Ok(()) => statuses[index] = json!("completed"),
                Err(error) => {
                    statuses[index] = json!("failed");
                    failures.push(BranchFailure { index, error });
                }
            }
        }

        let error = match report.aborted.first() {
            Some(join_error) => Some(StepError::BranchAborted {
                step_id: parallel.id.clone(),
                message: join_error.to_string(),
            }),
            None if !failures.is_empty() => Some(StepError::ParallelBranchFailure {
                step_id: parallel.id.clone(),
                failures,
            }),
            None => None,
        };

        let duration_ms = elapsed_ms(started);
        let peak = report.peak_concurrency;
        match error {
            None => {
                let branches: Vec<Value> = statuses
                    .into_iter()
                    .enumerate()
                    .map(|(index, status)| json!({ "index": index, "status": status }))
                    .collect();
                let output = json!({ "branches": branches, "peakConcurrency": peak });
                tracing::info!(run_id = %shared.run_id, step_id = %parallel.id, duration_ms, peak, "parallel step completed");
                self.finish(scope, StepResult::completed(&parallel.id, output, duration_ms, 0));
                shared.emit(WorkflowEvent::ParallelCompleted {
                    run_id: shared.run_id,
                    workflow_id: shared.workflow_id(),
                    step_id: parallel.id.clone(),
                    duration_ms,
                    peak_concurrency: peak,
                });
                Ok(())
            }
            Some(error) => {
                let failed_branches = statuses.iter().filter(|s| *s == "failed").count()
                    + report.aborted.len();
                tracing::warn!(
                    run_id = %shared.run_id,
                    step_id = %parallel.id,
                    failed_branches,
                    not_admitted = report.not_admitted.len(),
                    %error,
                    "parallel step failed"
                );
                self.finish(
                    scope,
                    StepResult::failed(&parallel.id, error.to_string(), duration_ms, 0),
                );
                shared.emit(WorkflowEvent::ParallelFailed {
                    run_id: shared.run_id,
                    workflow_id: shared.workflow_id(),
                    step_id: parallel.id.clone(),
                    error: error.to_string(),
                    failed_branches,
                    peak_concurrency: peak,
                });
                Err(error)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conditional
    // -----------------------------------------------------------------------

    async fn run_conditional(
        &self,
        scope: &mut Scope,
        conditional: &ConditionalStep,
    ) -> Result<(), StepError> {
        let shared = &self.shared;
        let started = Instant::now();
        self.emit_started(&conditional.id, "conditional");

        let matched = conditional
            .cases
            .iter()
            .position(|case| evaluate_condition(&case.condition, &scope.ctx, &conditional.id));

        let (selected, steps) = match (matched, &conditional.default) {
            (Some(index), _) => {
                shared.emit(WorkflowEvent::ConditionalMatched {
                    run_id: shared.run_id,
                    workflow_id: shared.workflow_id(),
                    step_id: conditional.id.clone(),
                    case_index: index,
                });
                (json!(index), Some(conditional.cases[index].steps.as_slice()))
            }
            (None, Some(default)) => {
                shared.emit(WorkflowEvent::ConditionalDefault {
                    run_id: shared.run_id,
                    workflow_id: shared.workflow_id(),
                    step_id: conditional.id.clone(),
                });
                (json!("default"), Some(default.as_slice()))
            }
            (None, None) => {
                shared.emit(WorkflowEvent::ConditionalNoMatch {
                    run_id: shared.run_id,
                    workflow_id: shared.workflow_id(),
                    step_id: conditional.id.clone(),
                });
                (Value::Null, None)
            }
        };
        tracing::info!(run_id = %shared.run_id, step_id = %conditional.id, matched = %selected, "conditional evaluated");

        let result = match steps {
            Some(steps) => self.run_sequence(scope, steps).await,
            None => Ok(()),
        };

        let duration_ms = elapsed_ms(started);
        match result {
            Ok(()) => {
                self.finish(
                    scope,
                    StepResult::completed(
                        &conditional.id,
                        json!({ "matched": selected }),
                        duration_ms,
                        0,
                    ),
                );
                Ok(())
            }
            Err(error) => {
                self.finish(
                    scope,
                    StepResult::failed(&conditional.id, error.to_string(), duration_ms, 0),
                );
                Err(error)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::adapter::TaskError;
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::testing::ScriptedAdapter;
    use sagaflow_types::workflow::StepStatus;

    fn setup(yaml: &str, adapter: &ScriptedAdapter) -> (StepRunner, Scope, Arc<WorkflowDefinition>) {
        let def = Arc::new(parse_workflow_yaml(yaml).unwrap());
        let ctx = ExecutionContext::new(&def.id, json!({"region": "eu"}), 1 << 20);
        let shared = RunShared::new(
            Arc::new(BoxTaskAdapter::new(adapter.clone())),
            EngineConfig::default(),
            Arc::clone(&def),
            EventBus::new(64),
            CancellationToken::new(),
            ctx.run_id,
        );
        let scope = Scope::root(ctx, shared.cancel.clone());
        (StepRunner::new(Arc::new(shared)), scope, def)
    }

    #[tokio::test]
    async fn test_unmet_dependency_skips_without_invocation() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: task
    id: a
    onFailure: continue
    task: { action: a.run }
  - type: task
    id: b
    dependsOn: [a]
    task: { action: b.run }
"#;
        let adapter = ScriptedAdapter::new().fail("a.run", TaskError::failed("boom"));
        let (runner, mut scope, def) = setup(yaml, &adapter);
        let result = runner.run_sequence(&mut scope, &def.steps).await;

        assert!(result.is_ok(), "continue absorbs the failure");
        assert_eq!(adapter.count("b.run"), 0);
        assert!(!scope.ctx.step_results.contains_key("b"));
        assert_eq!(scope.ctx.skipped.len(), 1);
        assert_eq!(
            scope.ctx.skipped[0].reason,
            SkipReason::DependencyUnmet {
                missing: vec!["a".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_false_condition_skips() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: task
    id: eu-only
    condition: "inputs.region == 'us'"
    task: { action: ship.us }
  - type: task
    id: always
    task: { action: ship.any }
"#;
        let adapter = ScriptedAdapter::new();
        let (runner, mut scope, def) = setup(yaml, &adapter);
        runner.run_sequence(&mut scope, &def.steps).await.unwrap();

        assert_eq!(adapter.calls(), vec!["ship.any"]);
        assert_eq!(scope.ctx.skipped[0].reason, SkipReason::ConditionFalse);
    }

    #[tokio::test]
    async fn test_failure_aborts_sequence() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: task
    id: a
    task: { action: a.run }
  - type: task
    id: b
    task: { action: b.run }
"#;
        let adapter = ScriptedAdapter::new().fail("a.run", TaskError::failed("boom"));
        let (runner, mut scope, def) = setup(yaml, &adapter);
        let err = runner.run_sequence(&mut scope, &def.steps).await.unwrap_err();

        assert_eq!(err.step_id(), "a");
        assert_eq!(adapter.count("b.run"), 0);
        assert_eq!(scope.ctx.step_results["a"].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_output_mapping_and_references() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: task
    id: reserve
    task:
      action: inventory.reserve
      outputs:
        reservationId: data.id
  - type: task
    id: charge
    task:
      action: payments.charge
      inputs:
        reservation: "$reserve.reservationId"
        note: "for {{ reserve.reservationId }} in {{inputs.region}}"
"#;
        let adapter = ScriptedAdapter::new().ok("inventory.reserve", json!({"data": {"id": "r-1"}}));
        let (runner, mut scope, def) = setup(yaml, &adapter);
        runner.run_sequence(&mut scope, &def.steps).await.unwrap();

        assert_eq!(scope.ctx.output("reserve"), Some(&json!({"reservationId": "r-1"})));
        let inputs = adapter.inputs_of("payments.charge");
        assert_eq!(inputs[0]["reservation"], "r-1");
        assert_eq!(inputs[0]["note"], "for r-1 in eu");
    }

    #[tokio::test]
    async fn test_compensation_units_are_not_run_forward() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: task
    id: a
    compensation: undo-a
    task: { action: a.run }
  - type: compensation
    id: undo-a
    task: { action: a.undo }
"#;
        let adapter = ScriptedAdapter::new();
        let (runner, mut scope, def) = setup(yaml, &adapter);
        runner.run_sequence(&mut scope, &def.steps).await.unwrap();

        assert_eq!(adapter.calls(), vec!["a.run"]);
        assert_eq!(scope.ctx.compensation_stack.len(), 1);
        assert_eq!(scope.ctx.compensation_stack[0].compensation_step_id, "undo-a");
        assert!(!scope.ctx.step_results.contains_key("undo-a"));
    }

    #[tokio::test]
    async fn test_parallel_merges_branch_results() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: parallel
    id: fan
    branches:
      - - type: task
          id: left
          compensation: undo
          task: { action: left.run }
      - - type: task
          id: right
          task: { action: right.run }
        - type: task
          id: right-2
          dependsOn: [right]
          task: { action: right.next }
  - type: compensation
    id: undo
    task: { action: left.undo }
"#;
        let adapter = ScriptedAdapter::new();
        let (runner, mut scope, def) = setup(yaml, &adapter);
        runner.run_sequence(&mut scope, &def.steps).await.unwrap();

        for id in ["left", "right", "right-2", "fan"] {
            assert!(scope.ctx.is_completed(id), "{id} should be completed");
        }
        assert_eq!(scope.ctx.compensation_stack.len(), 1);
        let fan = scope.ctx.output("fan").unwrap();
        assert_eq!(fan["branches"][1]["status"], "completed");
        assert!(fan["peakConcurrency"].as_u64().unwrap() <= 2);
    }

    #[tokio::test]
    async fn test_parallel_branch_failure_fails_unit() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: parallel
    id: fan
    branches:
      - - type: task
          id: good
          task: { action: good.run }
      - - type: task
          id: bad
          task: { action: bad.run }
"#;
        let adapter = ScriptedAdapter::new()
            .slow("good.run", 20, json!("ok"))
            .fail("bad.run", TaskError::failed("nope"));
        let (runner, mut scope, def) = setup(yaml, &adapter);
        let err = runner.run_sequence(&mut scope, &def.steps).await.unwrap_err();

        match &err {
            StepError::ParallelBranchFailure { step_id, failures } => {
                assert_eq!(step_id, "fan");
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 1);
            }
            other => panic!("expected ParallelBranchFailure, got {other:?}"),
        }
        assert!(scope.ctx.is_completed("good"), "admitted branch runs to completion");
        assert_eq!(scope.ctx.step_results["fan"].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_failure_does_not_preempt_running_branch() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: parallel
    id: fan
    maxConcurrency: 2
    branches:
      - - type: task
          id: a
          task: { action: a.run }
      - - type: task
          id: b
          task: { action: b.run }
      - - type: task
          id: c
          task: { action: c.run }
"#;
        let adapter = ScriptedAdapter::new()
            .slow_fail("a.run", 10, TaskError::failed("late failure"))
            .slow("b.run", 40, json!("b"));
        let (runner, mut scope, def) = setup(yaml, &adapter);
        let err = runner.run_sequence(&mut scope, &def.steps).await.unwrap_err();

        assert!(matches!(err, StepError::ParallelBranchFailure { .. }));
        assert_eq!(adapter.count("c.run"), 0, "admission stops after the failure");
        assert!(scope.ctx.is_completed("b"), "running branch is awaited");
    }

    #[tokio::test]
    async fn test_outer_failure_stops_nested_admission() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: parallel
    id: outer
    branches:
      - - type: task
          id: breaks
          task: { action: breaks.run }
      - - type: parallel
          id: inner
          maxConcurrency: 1
          branches:
            - - type: task
                id: x
                task: { action: x.run }
            - - type: task
                id: y
                task: { action: y.run }
"#;
        let adapter = ScriptedAdapter::new()
            .slow_fail("breaks.run", 10, TaskError::failed("boom"))
            .slow("x.run", 50, json!("x"));
        let (runner, mut scope, def) = setup(yaml, &adapter);
        let err = runner.run_sequence(&mut scope, &def.steps).await.unwrap_err();

        assert_eq!(err.step_id(), "outer");
        assert!(scope.ctx.is_completed("x"), "running inner branch is awaited");
        assert_eq!(adapter.count("y.run"), 0);
        let inner = scope.ctx.output("inner").unwrap();
        assert_eq!(inner["branches"][1]["status"], "not_admitted");
    }

    #[tokio::test]
    async fn test_continue_parallel_keeps_admitting() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: parallel
    id: fan
    onFailure: continue
    maxConcurrency: 1
    branches:
      - - type: task
          id: a
          task: { action: a.run }
      - - type: task
          id: b
          task: { action: b.run }
      - - type: task
          id: c
          task: { action: c.run }
"#;
        let adapter = ScriptedAdapter::new().fail("a.run", TaskError::failed("boom"));
        let (runner, mut scope, def) = setup(yaml, &adapter);
        runner.run_sequence(&mut scope, &def.steps).await.unwrap();

        assert_eq!(adapter.calls(), vec!["a.run", "b.run", "c.run"]);
        assert_eq!(scope.ctx.step_results["fan"].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_conditional_first_match_wins() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: conditional
    id: route
    cases:
      - condition: "false"
        steps:
          - type: task
            id: c0
            task: { action: case.0 }
      - condition: "true"
        steps:
          - type: task
            id: c1
            task: { action: case.1 }
      - condition: "true"
        steps:
          - type: task
            id: c2
            task: { action: case.2 }
"#;
        let adapter = ScriptedAdapter::new();
        let (runner, mut scope, def) = setup(yaml, &adapter);
        runner.run_sequence(&mut scope, &def.steps).await.unwrap();

        assert_eq!(adapter.calls(), vec!["case.1"]);
        assert_eq!(scope.ctx.output("route"), Some(&json!({"matched": 1})));
    }

    #[tokio::test]
    async fn test_conditional_default_and_no_match() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: conditional
    id: with-default
    cases:
      - condition: "inputs.region == 'us'"
        steps:
          - type: task
            id: us
            task: { action: ship.us }
    default:
      - type: task
        id: fallback
        task: { action: ship.default }
  - type: conditional
    id: no-default
    cases:
      - condition: "inputs.region == 'apac'"
        steps:
          - type: task
            id: apac
            task: { action: ship.apac }
"#;
        let adapter = ScriptedAdapter::new();
        let (runner, mut scope, def) = setup(yaml, &adapter);
        runner.run_sequence(&mut scope, &def.steps).await.unwrap();

        assert_eq!(adapter.calls(), vec!["ship.default"]);
        assert_eq!(
            scope.ctx.output("with-default"),
            Some(&json!({"matched": "default"}))
        );
        assert_eq!(scope.ctx.output("no-default"), Some(&json!({"matched": null})));
    }

    #[tokio::test]
    async fn test_conditional_inner_failure_propagates() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: conditional
    id: route
    cases:
      - condition: "true"
        steps:
          - type: task
            id: inner
            task: { action: inner.run }
"#;
        let adapter = ScriptedAdapter::new().fail("inner.run", TaskError::failed("bad"));
        let (runner, mut scope, def) = setup(yaml, &adapter);
        let err = runner.run_sequence(&mut scope, &def.steps).await.unwrap_err();

        assert_eq!(err.step_id(), "inner");
        assert_eq!(scope.ctx.step_results["route"].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_next_unit() {
        let yaml = r#"
id: wf
name: wf
version: "1"
steps:
  - type: task
    id: a
    task: { action: a.run }
"#;
        let adapter = ScriptedAdapter::new();
        let (runner, mut scope, def) = setup(yaml, &adapter);
        runner.shared.cancel.cancel();
        let err = runner.run_sequence(&mut scope, &def.steps).await.unwrap_err();

        assert!(matches!(err, StepError::Cancelled { .. }));
        assert!(adapter.calls().is_empty());
    }
}
