//! Per-run execution context.
//!
//! `ExecutionContext` is the record a run builds up: caller inputs, completed
//! outputs, one `StepResult` per executed step, skip records, the LIFO
//! compensation stack and the rollback log. It is exclusively owned by its
//! run. Parallel branches work on forks and hand their changes back as
//! `ContextUpdate`s, which the owner applies in order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sagaflow_types::workflow::{
    CompensationEntry, CompensationRecord, RunState, SkipReason, SkippedStep, StepResult,
    StepStatus,
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::error::StepError;

/// A single change recorded by a unit, replayable onto another context.
#[derive(Debug, Clone)]
pub enum ContextUpdate {
    Result(StepResult),
    Compensation(CompensationEntry),
    Skipped(SkippedStep),
}

/// Mutable state that tracks one workflow run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub inputs: Value,
    /// Outputs of completed steps keyed by step id.
    pub outputs: BTreeMap<String, Value>,
    pub step_results: BTreeMap<String, StepResult>,
    pub state: RunState,
    /// Registered undos, ordered by registration sequence (oldest first).
    pub compensation_stack: Vec<CompensationEntry>,
    pub skipped: Vec<SkippedStep>,
    pub compensation_log: Vec<CompensationRecord>,
    /// The error that failed the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    max_output_bytes: usize,
}

impl ExecutionContext {
    /// Create a pending context for a new run.
    pub fn new(workflow_id: &str, inputs: Value, max_output_bytes: usize) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            run_id: Uuid::now_v7(),
            inputs,
            outputs: BTreeMap::new(),
            step_results: BTreeMap::new(),
            state: RunState::Pending,
            compensation_stack: Vec::new(),
            skipped: Vec::new(),
            compensation_log: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
            max_output_bytes,
        }
    }

    /// Move to `next` if the lifecycle allows it. Illegal moves are ignored
    /// and reported as `false`.
    pub fn transition(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                run_id = %self.run_id,
                from = %self.state,
                to = %next,
                "ignoring illegal run state transition"
            );
            return false;
        }
        tracing::debug!(run_id = %self.run_id, from = %self.state, to = %next, "run state");
        match next {
            RunState::Running => self.started_at = Some(Utc::now()),
            RunState::Completed | RunState::Failed | RunState::Compensated => {
                self.completed_at = Some(Utc::now());
            }
            RunState::Pending | RunState::Compensating => {}
        }
        self.state = next;
        true
    }

    /// Apply a recorded change.
    pub fn apply(&mut self, update: ContextUpdate) {
        match update {
            ContextUpdate::Result(result) => self.record_result(result),
            ContextUpdate::Compensation(entry) => self.push_compensation(entry),
            ContextUpdate::Skipped(skipped) => self.skipped.push(skipped),
        }
    }

    /// Store a step result, superseding any earlier result for the same id.
    ///
    /// Outputs larger than the configured limit are replaced by a marker
    /// object. A failed result removes any stale output for the id.
    pub fn record_result(&mut self, mut result: StepResult) {
        match result.status {
            StepStatus::Completed => {
                let output = result.output.take().unwrap_or(Value::Null);
                let output = self.bounded_output(&result.step_id, output);
                self.outputs.insert(result.step_id.clone(), output.clone());
                result.output = Some(output);
            }
            StepStatus::Failed => {
                self.outputs.remove(&result.step_id);
            }
        }
        self.step_results.insert(result.step_id.clone(), result);
    }

    fn bounded_output(&self, step_id: &str, output: Value) -> Value {
        let size = match serde_json::to_vec(&output) {
            Ok(bytes) => bytes.len(),
            Err(_) => return output,
        };
        if size <= self.max_output_bytes {
            return output;
        }
        tracing::warn!(
            step_id,
            size,
            max = self.max_output_bytes,
            "step output exceeds size limit, truncating"
        );
        json!({
            "_truncated": true,
            "_originalSize": size,
            "_message": format!(
                "output exceeded {} byte limit and was truncated",
                self.max_output_bytes
            ),
        })
    }

    /// Register an undo, keeping the stack ordered by registration sequence.
    pub fn push_compensation(&mut self, entry: CompensationEntry) {
        if self
            .compensation_stack
            .iter()
            .any(|e| e.sequence == entry.sequence)
        {
            return;
        }
        let pos = self
            .compensation_stack
            .partition_point(|e| e.sequence < entry.sequence);
        self.compensation_stack.insert(pos, entry);
    }

    pub fn record_skip(&mut self, step_id: &str, reason: SkipReason) {
        self.skipped.push(SkippedStep {
            step_id: step_id.to_string(),
            reason,
        });
    }

    /// Whether `step_id` has a completed result.
    pub fn is_completed(&self, step_id: &str) -> bool {
        self.step_results
            .get(step_id)
            .is_some_and(StepResult::is_completed)
    }

    /// Output of a completed step.
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    /// Number of steps with a completed result.
    pub fn completed_count(&self) -> usize {
        self.step_results
            .values()
            .filter(|r| r.is_completed())
            .count()
    }

    /// Milliseconds between start and completion, if both are known.
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Read-only JSON binding that conditions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "outputs": { "<step_id>": <output>, ... },
    ///   "inputs": <caller inputs>,
    ///   "steps": { "<step_id>": { "status": "completed", "output": <value> } },
    ///   "<step_id>": <output>
    /// }
    /// ```
    /// Top-level step ids never shadow `outputs`, `inputs` or `steps`.
    pub fn expression_bindings(&self) -> Value {
        let mut steps = Map::new();
        for (id, result) in &self.step_results {
            steps.insert(
                id.clone(),
                json!({
                    "status": result.status,
                    "output": result.output.clone().unwrap_or(Value::Null),
                }),
            );
        }

        let mut root = Map::new();
        for (id, output) in &self.outputs {
            root.insert(id.clone(), output.clone());
        }
        root.insert("outputs".to_string(), json!(self.outputs));
        root.insert("inputs".to_string(), self.inputs.clone());
        root.insert("steps".to_string(), Value::Object(steps));
        Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("wf", json!({"sku": "A-1"}), 1024)
    }

    fn entry(step: &str, sequence: u64) -> CompensationEntry {
        CompensationEntry {
            step_id: step.to_string(),
            compensation_step_id: format!("undo-{step}"),
            sequence,
        }
    }

    #[test]
    fn test_new_context_is_pending() {
        let ctx = ctx();
        assert_eq!(ctx.state, RunState::Pending);
        assert!(ctx.step_results.is_empty());
        assert!(ctx.compensation_stack.is_empty());
        assert_eq!(ctx.run_id.get_version_num(), 7);
    }

    #[test]
    fn test_transition_rejects_illegal_moves() {
        let mut ctx = ctx();
        assert!(!ctx.transition(RunState::Completed));
        assert!(ctx.transition(RunState::Running));
        assert!(ctx.started_at.is_some());
        assert!(ctx.transition(RunState::Completed));
        assert!(!ctx.transition(RunState::Compensating));
        assert_eq!(ctx.state, RunState::Completed);
    }

    #[test]
    fn test_record_result_supersedes() {
        let mut ctx = ctx();
        ctx.record_result(StepResult::completed("a", json!({"v": 1}), 1, 1));
        assert!(ctx.is_completed("a"));
        assert_eq!(ctx.output("a"), Some(&json!({"v": 1})));

        ctx.record_result(StepResult::failed("a", "boom".to_string(), 1, 2));
        assert!(!ctx.is_completed("a"));
        assert!(ctx.output("a").is_none());
        assert_eq!(ctx.step_results.len(), 1);
    }

    #[test]
    fn test_large_output_is_truncated() {
        let mut ctx = ExecutionContext::new("wf", Value::Null, 16);
        ctx.record_result(StepResult::completed(
            "big",
            json!({"data": "x".repeat(100)}),
            1,
            1,
        ));
        let output = ctx.output("big").unwrap();
        assert_eq!(output["_truncated"], true);
        assert_eq!(
            ctx.step_results["big"].output.as_ref().unwrap()["_truncated"],
            true
        );
    }

    #[test]
    fn test_compensation_stack_orders_by_sequence() {
        let mut ctx = ctx();
        ctx.push_compensation(entry("c", 3));
        ctx.push_compensation(entry("a", 1));
        ctx.push_compensation(entry("b", 2));
        ctx.push_compensation(entry("b", 2));
        let order: Vec<&str> = ctx
            .compensation_stack
            .iter()
            .map(|e| e.step_id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_apply_replays_updates() {
        let mut owner = ctx();
        let mut fork = owner.clone();
        let updates = vec![
            ContextUpdate::Result(StepResult::completed("b", json!(2), 1, 1)),
            ContextUpdate::Compensation(entry("b", 5)),
            ContextUpdate::Skipped(SkippedStep {
                step_id: "c".to_string(),
                reason: SkipReason::ConditionFalse,
            }),
        ];
        for update in &updates {
            fork.apply(update.clone());
        }
        for update in updates {
            owner.apply(update);
        }
        assert!(owner.is_completed("b"));
        assert_eq!(owner.compensation_stack.len(), 1);
        assert_eq!(owner.skipped.len(), 1);
        assert_eq!(owner.outputs, fork.outputs);
    }

    #[test]
    fn test_expression_bindings_shape() {
        let mut ctx = ctx();
        ctx.record_result(StepResult::completed("reserve", json!({"ok": true}), 1, 1));
        ctx.record_result(StepResult::completed("inputs", json!("shadow"), 1, 1));
        let bindings = ctx.expression_bindings();
        assert_eq!(bindings["reserve"]["ok"], true);
        assert_eq!(bindings["outputs"]["reserve"]["ok"], true);
        assert_eq!(bindings["steps"]["reserve"]["status"], "completed");
        assert_eq!(bindings["inputs"]["sku"], "A-1", "inputs must not be shadowed");
    }

    #[test]
    fn test_context_serializes_camel_case() {
        let ctx = ctx();
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["workflowId"], "wf");
        assert_eq!(json["state"], "pending");
        assert!(json.get("maxOutputBytes").is_none());
    }
}
