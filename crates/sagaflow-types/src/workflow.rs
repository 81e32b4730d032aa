//! Workflow domain types for sagaflow.
//!
//! Defines the canonical representation of a workflow document
//! (`WorkflowDefinition` and its closed `StepUnit` variants) together with the
//! execution records a run produces (`StepResult`, `RunState`, compensation
//! bookkeeping). Documents are camelCase on the wire so YAML and JSON files
//! share one shape.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative workflow: an ordered list of step units plus run-wide policy.
///
/// Immutable once a run starts; the engine clones it into the run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Stable workflow identifier.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Version string of the document (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered step units, executed in declaration order.
    pub steps: Vec<StepUnit>,
    /// Default per-step timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Default retry policy for task steps that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// What to roll back when the run fails.
    #[serde(default)]
    pub compensation_policy: CompensationPolicy,
    /// Workflow-level cap on concurrently running parallel branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Rollback scope applied when a run fails.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CompensationPolicy {
    /// Never compensate.
    #[default]
    None,
    /// Compensate only the most recently registered step.
    Partial,
    /// Compensate every registered step, newest first.
    Full,
}

impl fmt::Display for CompensationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompensationPolicy::None => f.write_str("none"),
            CompensationPolicy::Partial => f.write_str("partial"),
            CompensationPolicy::Full => f.write_str("full"),
        }
    }
}

// ---------------------------------------------------------------------------
// Step units
// ---------------------------------------------------------------------------

/// One unit of a workflow sequence.
///
/// Internally tagged by `type`:
/// ```yaml
/// - type: task
///   id: reserve
///   task:
///     action: inventory.reserve
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepUnit {
    /// Invoke a task through the task adapter.
    Task(TaskStep),
    /// Run independent branches concurrently under the concurrency governor.
    Parallel(ParallelStep),
    /// Run the first case whose condition holds, or the default.
    Conditional(ConditionalStep),
    /// Undo action, only ever invoked during rollback.
    Compensation(CompensationStep),
}

/// Every `type` tag a document may use.
pub const STEP_TYPES: [&str; 4] = ["task", "parallel", "conditional", "compensation"];

impl StepUnit {
    /// The step id, unique within the workflow.
    pub fn id(&self) -> &str {
        match self {
            StepUnit::Task(s) => &s.id,
            StepUnit::Parallel(s) => &s.id,
            StepUnit::Conditional(s) => &s.id,
            StepUnit::Compensation(s) => &s.id,
        }
    }

    /// The `type` tag of this unit.
    pub fn kind(&self) -> &'static str {
        match self {
            StepUnit::Task(_) => "task",
            StepUnit::Parallel(_) => "parallel",
            StepUnit::Conditional(_) => "conditional",
            StepUnit::Compensation(_) => "compensation",
        }
    }

    /// Step ids that must have completed before this unit may run.
    pub fn depends_on(&self) -> &[String] {
        match self {
            StepUnit::Task(s) => &s.depends_on,
            StepUnit::Parallel(s) => &s.depends_on,
            StepUnit::Conditional(s) => &s.depends_on,
            StepUnit::Compensation(_) => &[],
        }
    }

    /// Optional gating condition.
    pub fn condition(&self) -> Option<&str> {
        match self {
            StepUnit::Task(s) => s.condition.as_deref(),
            StepUnit::Parallel(s) => s.condition.as_deref(),
            StepUnit::Conditional(s) => s.condition.as_deref(),
            StepUnit::Compensation(_) => None,
        }
    }

    /// Failure handling for this unit.
    pub fn on_failure(&self) -> OnFailure {
        match self {
            StepUnit::Task(s) => s.on_failure,
            StepUnit::Parallel(s) => s.on_failure,
            StepUnit::Conditional(s) => s.on_failure,
            StepUnit::Compensation(_) => OnFailure::Fail,
        }
    }

    /// Direct child sequences (parallel branches, conditional cases and default).
    pub fn children(&self) -> Vec<&[StepUnit]> {
        match self {
            StepUnit::Parallel(p) => p.branches.iter().map(Vec::as_slice).collect(),
            StepUnit::Conditional(c) => c
                .cases
                .iter()
                .map(|case| case.steps.as_slice())
                .chain(c.default.as_deref())
                .collect(),
            StepUnit::Task(_) | StepUnit::Compensation(_) => Vec::new(),
        }
    }
}

/// What a failed step does to its enclosing sequence.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the current sequence.
    #[default]
    Fail,
    /// Absorb the failure and move on to the next sibling.
    Continue,
    /// Abort the current sequence; the run rolls back under its policy.
    Compensate,
}

impl OnFailure {
    /// Whether a failure with this setting aborts the enclosing sequence.
    pub fn aborts_sequence(self) -> bool {
        matches!(self, OnFailure::Fail | OnFailure::Compensate)
    }
}

/// A task step: one adapter invocation with retry, timeout and optional undo.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    #[serde(alias = "stepId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// JEXL condition evaluated against completed outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Id of the compensation unit that undoes this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<String>,
    pub task: TaskSpec,
}

/// The business action bound to a task or compensation step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Adapter action identifier (e.g. "payments.charge").
    pub action: String,
    /// Inputs, possibly containing `$stepId` / `{{stepId}}` references.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub inputs: Value,
    /// Output mapping: field name -> dot path into the raw result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,
}

/// Concurrent fan-out of independent branches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParallelStep {
    #[serde(alias = "stepId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Requested number of simultaneously running branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    pub branches: Vec<Vec<StepUnit>>,
}

/// First-match-wins branching.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalStep {
    #[serde(alias = "stepId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_failure: OnFailure,
    pub cases: Vec<ConditionalCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<StepUnit>>,
}

/// One case of a conditional unit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalCase {
    pub condition: String,
    pub steps: Vec<StepUnit>,
}

/// Undo action referenced by a task's `compensation` field.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompensationStep {
    #[serde(alias = "stepId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    pub task: TaskSpec,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first (default 1, i.e. no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first retry (default 1000).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Growth factor between consecutive delays (default 2).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay (default 60000).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Error codes or message substrings that may be retried (absent = all).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<String>>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            retryable_errors: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl RunState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// Forward only: `pending -> running -> completed | failed`, plus the
    /// single rollback tail `failed -> compensating -> compensated`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::Running)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
                | (RunState::Failed, RunState::Compensating)
                | (RunState::Compensating, RunState::Compensated)
        )
    }

    /// Whether the run has nowhere further to go.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Compensated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Compensating => "compensating",
            RunState::Compensated => "compensated",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Completed => f.write_str("completed"),
            StepStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Record written once per executed step id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Number of adapter attempts (0 for composite units).
    #[serde(default)]
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    pub fn completed(step_id: &str, output: Value, duration_ms: u64, attempts: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            duration_ms,
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(step_id: &str, error: String, duration_ms: u64, attempts: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            duration_ms,
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// A registered undo: `compensation_step_id` reverts `step_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationEntry {
    pub step_id: String,
    pub compensation_step_id: String,
    /// Run-wide registration order (forward completion order).
    pub sequence: u64,
}

/// What the rollback walk did for one stack entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationRecord {
    pub step_id: String,
    pub compensation_step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a unit was not executed. Skips are not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Listed dependencies are missing or not completed.
    DependencyUnmet { missing: Vec<String> },
    /// The unit's condition evaluated to false.
    ConditionFalse,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyUnmet { missing } => {
                write!(f, "dependency unmet: {}", missing.join(", "))
            }
            SkipReason::ConditionFalse => f.write_str("condition false"),
        }
    }
}

/// A unit passed over by the dependency or condition gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedStep {
    pub step_id: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
