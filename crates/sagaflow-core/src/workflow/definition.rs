//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML/JSON documents and the canonical `WorkflowDefinition`,
//! validates structural constraints (unique IDs, valid dependencies and
//! compensation targets, sane policies), and discovers workflow files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sagaflow_types::workflow::{RetryPolicy, STEP_TYPES, StepUnit, WorkflowDefinition};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or preparing a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A step carries a `type` tag outside the closed set of step kinds.
    #[error("unknown step type '{step_type}' for step '{step_id}'")]
    UnknownStepType { step_id: String, step_type: String },

    /// Structural validation failure; every collected error is listed.
    #[error("validation failed: {}", .0.join("; "))]
    ValidationError(Vec<String>),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The `dependsOn` graph contains a cycle.
    #[error("cyclic dependency: {0}")]
    CyclicDependency(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a `WorkflowDefinition`.
///
/// Only deserializes; call [`validate_definition`] (or use
/// [`load_workflow_file`]) for structural checks.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let raw: Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    from_document(raw)
}

/// Parse a JSON document into a `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let raw: Value =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    from_document(raw)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

fn from_document(raw: Value) -> Result<WorkflowDefinition, WorkflowError> {
    if let Some(steps) = raw.get("steps").and_then(Value::as_array) {
        check_step_types(steps)?;
    }
    serde_json::from_value(raw).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Walk the raw step tree so an unknown tag surfaces as `UnknownStepType`
/// rather than a generic serde message.
fn check_step_types(steps: &[Value]) -> Result<(), WorkflowError> {
    for step in steps {
        let Some(step_type) = step.get("type").and_then(Value::as_str) else {
            continue;
        };
        if !STEP_TYPES.contains(&step_type) {
            let step_id = step
                .get("id")
                .or_else(|| step.get("stepId"))
                .and_then(Value::as_str)
                .unwrap_or("<unnamed>");
            return Err(WorkflowError::UnknownStepType {
                step_id: step_id.to_string(),
                step_type: step_type.to_string(),
            });
        }

        if let Some(branches) = step.get("branches").and_then(Value::as_array) {
            for branch in branches.iter().filter_map(Value::as_array) {
                check_step_types(branch)?;
            }
        }
        if let Some(cases) = step.get("cases").and_then(Value::as_array) {
            for case_steps in cases
                .iter()
                .filter_map(|c| c.get("steps").and_then(Value::as_array))
            {
                check_step_types(case_steps)?;
            }
        }
        if let Some(default) = step.get("default").and_then(Value::as_array) {
            check_step_types(default)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reserved reference namespace for caller inputs.
pub const RESERVED_INPUTS_ID: &str = "inputs";

/// Outcome of structural validation: every problem found, not just the first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    /// Convert into a `Result`, folding all errors into `ValidationError`.
    pub fn into_result(self) -> Result<(), WorkflowError> {
        if self.valid {
            Ok(())
        } else {
            Err(WorkflowError::ValidationError(self.errors))
        }
    }
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - `id`, `name` and `version` are non-empty
/// - At least one step exists
/// - Step IDs are non-empty, unique across all nesting levels, and not `inputs`
/// - All `dependsOn` references point to existing step IDs
/// - `compensation` references point to compensation units
/// - Retry policies have `maxAttempts >= 1` and `backoffMultiplier >= 1`
/// - Timeouts are > 0 and `maxConcurrency >= 1` when set
/// - Parallel units have branches, conditional units have cases
/// - The dependency graph is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> ValidationReport {
    let mut errors = Vec::new();

    if def.id.trim().is_empty() {
        errors.push("workflow id must not be empty".to_string());
    }
    if def.name.trim().is_empty() {
        errors.push("workflow name must not be empty".to_string());
    }
    if def.version.trim().is_empty() {
        errors.push("workflow version must not be empty".to_string());
    }
    if def.steps.is_empty() {
        errors.push("workflow must have at least one step".to_string());
    }
    if def.timeout_ms == Some(0) {
        errors.push("workflow timeoutMs must be > 0".to_string());
    }
    if def.max_concurrency == Some(0) {
        errors.push("workflow maxConcurrency must be >= 1".to_string());
    }
    if let Some(policy) = &def.retry_policy {
        check_retry_policy("workflow retryPolicy", policy, &mut errors);
    }

    let flat = dag::flatten_steps(&def.steps);

    let mut seen_ids = HashSet::new();
    for unit in &flat {
        let id = unit.id();
        if id.trim().is_empty() {
            errors.push(format!("{} step has an empty id", unit.kind()));
        } else if id == RESERVED_INPUTS_ID {
            errors.push(format!(
                "step id '{RESERVED_INPUTS_ID}' is reserved for caller inputs"
            ));
        } else if !seen_ids.insert(id) {
            errors.push(format!("duplicate step ID: '{id}'"));
        }
    }

    for unit in &flat {
        for dep in unit.depends_on() {
            if !seen_ids.contains(dep.as_str()) {
                errors.push(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    unit.id()
                ));
            }
        }
        check_unit(unit, &flat, &mut errors);
    }

    if let Err(e) = dag::check_acyclic(&def.steps) {
        errors.push(e.to_string());
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

fn check_unit(unit: &StepUnit, flat: &[&StepUnit], errors: &mut Vec<String>) {
    match unit {
        StepUnit::Task(task) => {
            if task.task.action.trim().is_empty() {
                errors.push(format!("task step '{}' has an empty action", task.id));
            }
            if task.timeout_ms == Some(0) {
                errors.push(format!("step '{}' timeoutMs must be > 0", task.id));
            }
            if let Some(policy) = &task.retry {
                check_retry_policy(&format!("step '{}' retry", task.id), policy, errors);
            }
            if let Some(target) = &task.compensation {
                match flat.iter().find(|u| u.id() == target.as_str()) {
                    Some(StepUnit::Compensation(_)) => {}
                    Some(other) => errors.push(format!(
                        "step '{}' compensation '{target}' is a {} step, not a compensation step",
                        task.id,
                        other.kind()
                    )),
                    None => errors.push(format!(
                        "step '{}' references unknown compensation step '{target}'",
                        task.id
                    )),
                }
            }
        }
        StepUnit::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                errors.push(format!(
                    "parallel step '{}' must have at least one branch",
                    parallel.id
                ));
            }
            if parallel.max_concurrency == Some(0) {
                errors.push(format!(
                    "parallel step '{}' maxConcurrency must be >= 1",
                    parallel.id
                ));
            }
        }
        StepUnit::Conditional(conditional) => {
            if conditional.cases.is_empty() {
                errors.push(format!(
                    "conditional step '{}' must have at least one case",
                    conditional.id
                ));
            }
            for (index, case) in conditional.cases.iter().enumerate() {
                if case.condition.trim().is_empty() {
                    errors.push(format!(
                        "conditional step '{}' case {index} has an empty condition",
                        conditional.id
                    ));
                }
            }
        }
        StepUnit::Compensation(compensation) => {
            if compensation.task.action.trim().is_empty() {
                errors.push(format!(
                    "compensation step '{}' has an empty action",
                    compensation.id
                ));
            }
            if compensation.timeout_ms == Some(0) {
                errors.push(format!("step '{}' timeoutMs must be > 0", compensation.id));
            }
            if let Some(policy) = &compensation.retry {
                check_retry_policy(&format!("step '{}' retry", compensation.id), policy, errors);
            }
        }
    }
}

fn check_retry_policy(label: &str, policy: &RetryPolicy, errors: &mut Vec<String>) {
    if policy.max_attempts < 1 {
        errors.push(format!("{label} maxAttempts must be >= 1"));
    }
    if policy.backoff_multiplier.is_nan() || policy.backoff_multiplier < 1.0 {
        errors.push(format!("{label} backoffMultiplier must be >= 1"));
    }
}

// ---------------------------------------------------------------------------
// JSON Schema
// ---------------------------------------------------------------------------

/// JSON Schema describing a workflow document.
pub fn workflow_json_schema() -> Result<Value, WorkflowError> {
    let schema = schemars::schema_for!(WorkflowDefinition);
    serde_json::to_value(schema).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

fn is_workflow_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}

/// Parse a workflow file without validating it. `.json` files are read as
/// JSON, everything else as YAML.
pub fn read_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    if is_json(path) {
        parse_workflow_json(&content)
    } else {
        parse_workflow_yaml(&content)
    }
}

/// Load and validate a workflow file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let def = read_workflow_file(path)?;
    validate_definition(&def).into_result()?;
    Ok(def)
}

/// Save a workflow definition, as JSON for `.json` paths and YAML otherwise.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = if is_json(path) {
        serde_json::to_string_pretty(def).map_err(|e| WorkflowError::ParseError(e.to_string()))?
    } else {
        serialize_workflow_yaml(def)?
    };
    std::fs::write(path, content)?;
    Ok(())
}

/// List workflow files (`.yaml`, `.yml`, `.json`) under `base_dir`,
/// recursively, sorted by path. A missing directory yields an empty list.
pub fn workflow_files(base_dir: &Path) -> Result<Vec<PathBuf>, WorkflowError> {
    let mut files = Vec::new();
    if base_dir.exists() {
        collect_files(base_dir, &mut files)?;
    }
    files.sort();
    Ok(files)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if is_workflow_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

/// Discover all valid workflow files under `base_dir`.
///
/// Files that fail to load are skipped with a warning. Results are sorted by
/// path.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    for path in workflow_files(base_dir)? {
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(error) => {
                tracing::warn!(?path, %error, "skipping unloadable workflow file");
            }
        }
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
