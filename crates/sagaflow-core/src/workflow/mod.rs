//! Workflow engine core: definitions, validation and saga execution.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem load/save
//! - `dag` -- step flattening, compensation index, cycle detection
//! - `context` -- per-run execution record and context updates
//! - `resolver` -- `$step` / `{{step}}` reference resolution in inputs
//! - `expression` -- JEXL evaluator for step and case conditions
//! - `adapter` -- task adapter seam and the dry-run adapter
//! - `retry` -- bounded retry with exponential backoff
//! - `timeout` -- deadline guard for task invocations
//! - `governor` -- bounded worker pool for parallel branches
//! - `step_runner` -- gating and dispatch for every step unit kind
//! - `compensation` -- rollback walk over the compensation stack
//! - `executor` -- `WorkflowEngine`, the run entry point

pub mod adapter;
pub mod compensation;
pub mod context;
pub mod dag;
pub mod definition;
pub mod error;
pub mod executor;
pub mod expression;
pub mod governor;
pub mod resolver;
pub mod retry;
pub mod step_runner;
pub mod timeout;

#[cfg(test)]
mod testing;
