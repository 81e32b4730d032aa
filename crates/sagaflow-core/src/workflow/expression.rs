//! JEXL condition evaluation for step gates and conditional cases.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of standard transforms. The
//! grammar is whitelisted: expressions can only read the bindings they are
//! given (see [`ExecutionContext::expression_bindings`]) and call the
//! registered transforms. Context data is always passed as bindings, never
//! interpolated into expression strings.

use serde_json::{Value, json};

use super::context::ExecutionContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid bindings: {0}")]
    InvalidBindings(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
///
/// Not shared across tasks: build one where it is needed and drop it before
/// the next suspension point.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

fn first_str(args: &[Value]) -> &str {
    args.first().and_then(|v| v.as_str()).unwrap_or("")
}

fn second_str(args: &[Value]) -> &str {
    args.get(1).and_then(|v| v.as_str()).unwrap_or("")
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(first_str(args).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(first_str(args).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(first_str(args).trim())))
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        items.contains(args.get(1).unwrap_or(&Value::Null))
                    }
                    _ => first_str(args).contains(second_str(args)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(first_str(args).starts_with(second_str(args))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(first_str(args).ends_with(second_str(args))))
            })
            // Works on strings, arrays and objects
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    ///
    /// `bindings` must be a JSON object.
    pub fn evaluate_bool(&self, expression: &str, bindings: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, bindings)
            .map(|result| truthy(&result))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, bindings: &Value) -> Result<Value, ExpressionError> {
        if !bindings.is_object() {
            return Err(ExpressionError::InvalidBindings(
                "bindings must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, bindings)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate a step or case condition against the run's recorded state.
///
/// Evaluation errors count as `false` and are logged.
pub fn evaluate_condition(expression: &str, ctx: &ExecutionContext, step_id: &str) -> bool {
    let bindings = ctx.expression_bindings();
    match ConditionEvaluator::new().evaluate_bool(expression, &bindings) {
        Ok(result) => {
            tracing::debug!(step_id, expression, result, "condition evaluated");
            result
        }
        Err(error) => {
            tracing::warn!(
                run_id = %ctx.run_id,
                step_id,
                expression,
                %error,
                "condition evaluation failed, treating as false"
            );
            false
        }
    }
}
